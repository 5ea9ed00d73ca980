use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Holds the NDJSON file of the run in progress, if any.
#[derive(Debug, Default)]
struct AuditSink {
    file: Mutex<Option<BufWriter<File>>>,
}

impl AuditSink {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a run log is already open",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *slot = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

struct AuditWriter<'a> {
    slot: MutexGuard<'a, Option<BufWriter<File>>>,
}

impl Write for AuditWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.slot.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.slot.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for AuditSink {
    type Writer = AuditWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        AuditWriter { slot: self.lock() }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &AuditSink {
    type Writer = AuditWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(thesisflow_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = thesisflow_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("THESISFLOW_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the global subscriber once. Human-readable lines go to stderr
/// when `stderr` is set; the NDJSON audit layer only writes while a run log
/// is open.
pub fn init_logging(stderr: bool) {
    TRACING_INIT.get_or_init(|| {
        let sink = AUDIT_SINK.get_or_init(AuditSink::default);

        let audit = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(sink);

        let console = stderr.then(|| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new("warn").add_directive(
                    "thesisflow_admin_core=info"
                        .parse()
                        .unwrap_or_else(|_| LevelFilter::INFO.into()),
                ))
        });

        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(audit)
            .with(console)
            .try_init();
    });
}

/// Closes the audit file when dropped.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(sink) = AUDIT_SINK.get() {
            let _ = sink.close();
        }
    }
}

pub fn start_run_log(kind: &str, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_logging(false);

    if !matches!(kind, "backup" | "restore") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported run kind: {kind}"),
        ));
    }

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let path = log_dir.join(format!(
        "{}-{}-{}.ndjson",
        kind,
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_component(run_id)
    ));

    AUDIT_SINK.get_or_init(AuditSink::default).open(&path)?;
    Ok(RunLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    match std::env::var("THESISFLOW_LOG_DIR") {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => data_dir.join("logs"),
    }
}

fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_thesisflow_then_rust_log_then_info() {
        assert_eq!(build_env_filter_from(Some("debug"), Some("warn")).to_string(), "debug");
        assert_eq!(build_env_filter_from(None, Some("warn")).to_string(), "warn");
        assert_eq!(build_env_filter_from(None, None).to_string(), "info");
    }

    #[test]
    fn rejects_unknown_run_kind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = start_run_log("export", "r1", temp.path()).err().expect("error");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn sanitizes_run_id_in_file_name() {
        assert_eq!(sanitize_component("run/1 ä"), "run_1__");
    }

    #[test]
    fn restore_run_log_is_ndjson() {
        let temp = tempfile::tempdir().expect("tempdir");
        let guard = start_run_log("restore", "run_test", temp.path()).expect("start_run_log");
        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));

        tracing::info!(event = "restore.start", run_id = "run_test", "restore.start");
        tracing::warn!(event = "restore.error", step = "auto-backup", "restore.error");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("read run log");
        assert!(!text.trim().is_empty());
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("json line");
            assert!(v.get("timestamp").is_some());
            assert!(v.get("level").is_some());
            assert!(v["fields"].get("event").is_some() || v["fields"].get("message").is_some());
        }
    }
}
