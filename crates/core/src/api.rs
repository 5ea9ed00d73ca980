use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::ClientConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct BackupDownload {
    pub bytes: Vec<u8>,
    pub content_disposition: Option<String>,
}

/// The backend endpoints the backup screens talk to.
pub trait BackupApi: Send + Sync {
    fn create_backup<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<BackupDownload>> + Send + 'a>>;

    fn restore_backup<'a>(
        &'a self,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

pub struct HttpBackupApi {
    config: ClientConfig,
    client: reqwest::Client,
}

impl HttpBackupApi {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.access_token.as_deref() {
            Some(token) if !token.is_empty() => req.bearer_auth(token),
            _ => req,
        }
    }
}

impl BackupApi for HttpBackupApi {
    fn create_backup<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<BackupDownload>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.config.endpoint("backup/create");
            tracing::debug!(event = "http.request", method = "GET", url = %url, "http.request");

            let res = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .map_err(|e| Error::Http {
                    message: e.to_string(),
                })?;

            let status = res.status();
            let content_disposition = res
                .headers()
                .get(CONTENT_DISPOSITION)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
            let bytes = res.bytes().await.map_err(|e| Error::Http {
                message: e.to_string(),
            })?;

            if !status.is_success() {
                return Err(Error::Api {
                    status: status.as_u16(),
                    message: extract_error_message(
                        status.as_u16(),
                        &String::from_utf8_lossy(&bytes),
                    ),
                });
            }

            Ok(BackupDownload {
                bytes: bytes.to_vec(),
                content_disposition,
            })
        })
    }

    fn restore_backup<'a>(
        &'a self,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.config.endpoint("backup/restore");
            tracing::debug!(
                event = "http.request",
                method = "POST",
                url = %url,
                bytes = body.len(),
                "http.request"
            );

            let res = self
                .authorize(self.client.post(&url))
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| Error::Http {
                    message: e.to_string(),
                })?;

            let status = res.status();
            if status.is_success() {
                return Ok(());
            }
            let text = res.text().await.unwrap_or_default();
            Err(Error::Api {
                status: status.as_u16(),
                message: extract_error_message(status.as_u16(), &text),
            })
        })
    }
}

/// Picks the most useful message out of an error response body: a JSON
/// `message`, then a JSON `error`, then the raw text.
pub fn extract_error_message(status: u16, body: &str) -> String {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(Value::String(s)) = obj.get(key)
                && !s.trim().is_empty()
            {
                return s.clone();
            }
        }
    }
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {status}")
    } else {
        body.to_string()
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    export: Vec<u8>,
    content_disposition: Option<String>,
    create_failures: Vec<String>,
    restore_failures: Vec<String>,
    restored: Vec<String>,
    delay: Option<Duration>,
}

/// Backend double that serves a fixed export and records restore bodies.
#[derive(Debug, Default)]
pub struct InMemoryBackupApi {
    pub creates: AtomicUsize,
    pub restores: AtomicUsize,
    inner: Mutex<InMemoryState>,
}

impl InMemoryBackupApi {
    pub fn new(export: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Mutex::new(InMemoryState {
                export: export.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub async fn set_content_disposition(&self, value: impl Into<String>) {
        self.inner.lock().await.content_disposition = Some(value.into());
    }

    pub async fn fail_next_create(&self, message: impl Into<String>) {
        self.inner.lock().await.create_failures.push(message.into());
    }

    pub async fn fail_next_restore(&self, message: impl Into<String>) {
        self.inner.lock().await.restore_failures.push(message.into());
    }

    /// Every call sleeps this long before answering.
    pub async fn set_delay(&self, delay: Duration) {
        self.inner.lock().await.delay = Some(delay);
    }

    pub async fn restored_bodies(&self) -> Vec<String> {
        self.inner.lock().await.restored.clone()
    }

    async fn pause(&self) {
        let delay = self.inner.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl BackupApi for InMemoryBackupApi {
    fn create_backup<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<BackupDownload>> + Send + 'a>> {
        Box::pin(async move {
            self.pause().await;
            self.creates.fetch_add(1, Ordering::Relaxed);
            let mut state = self.inner.lock().await;
            if !state.create_failures.is_empty() {
                let message = state.create_failures.remove(0);
                return Err(Error::Api {
                    status: 500,
                    message,
                });
            }
            Ok(BackupDownload {
                bytes: state.export.clone(),
                content_disposition: state.content_disposition.clone(),
            })
        })
    }

    fn restore_backup<'a>(
        &'a self,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.pause().await;
            self.restores.fetch_add(1, Ordering::Relaxed);
            let mut state = self.inner.lock().await;
            if !state.restore_failures.is_empty() {
                let message = state.restore_failures.remove(0);
                return Err(Error::Api {
                    status: 500,
                    message,
                });
            }
            state.restored.push(body);
            Ok(())
        })
    }
}
