use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::BackupApi;
use crate::backup_file::BackupSummary;
use crate::config::ClientConfig;
use crate::filename::resolve_backup_filename;
use crate::wizard::{PreRestoreBackup, RestoreStep, RestoreWizard, WizardEvent};
use crate::{Error, Result};

/// Whatever "refresh the client" means for the front-end driving the wizard.
pub trait Reloader: Send + Sync {
    fn reload(&self);
}

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub filename_prefix: String,
    pub reload_delay: Duration,
}

impl From<&ClientConfig> for WorkflowOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            filename_prefix: config.filename_prefix.clone(),
            reload_delay: config.reload_delay(),
        }
    }
}

/// Drives a [`RestoreWizard`] against a [`BackupApi`].
///
/// Each session owns a cancellation token. Tripping it (through
/// [`RestoreWorkflow::cancel_handle`] or [`RestoreWorkflow::cancel`]) makes an
/// in-flight safety backup resolve as [`Error::Cancelled`] and drops the
/// session, so a late response never lands in a discarded session.
pub struct RestoreWorkflow<A: BackupApi> {
    api: Arc<A>,
    wizard: RestoreWizard,
    options: WorkflowOptions,
    session_token: CancellationToken,
    reload_token: Option<CancellationToken>,
}

impl<A: BackupApi + 'static> RestoreWorkflow<A> {
    pub fn new(api: Arc<A>, options: WorkflowOptions) -> Self {
        Self {
            api,
            wizard: RestoreWizard::new(),
            options,
            session_token: CancellationToken::new(),
            reload_token: None,
        }
    }

    pub fn wizard(&self) -> &RestoreWizard {
        &self.wizard
    }

    pub fn wizard_mut(&mut self) -> &mut RestoreWizard {
        &mut self.wizard
    }

    pub fn step(&self) -> RestoreStep {
        self.wizard.step()
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// Token of the current session; cancelling it aborts the pending step.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.session_token.clone()
    }

    pub fn start(&mut self) -> Result<()> {
        self.wizard.transition(WizardEvent::Start)?;
        self.session_token = CancellationToken::new();
        tracing::info!(event = "restore.start", "restore.start");
        Ok(())
    }

    pub fn confirm_risk(&mut self) -> Result<()> {
        self.wizard.transition(WizardEvent::ConfirmRisk)?;
        Ok(())
    }

    /// Requests the server-side safety backup. On failure the wizard stays in
    /// `auto-backup` with the error set, and calling this again retries.
    pub async fn run_auto_backup(&mut self) -> Result<&PreRestoreBackup> {
        if self.wizard.step() != RestoreStep::AutoBackup
            || self.wizard.session().pre_backup.is_some()
        {
            return Err(Error::InvalidTransition {
                step: self.wizard.step(),
                event: "run-auto-backup",
            });
        }
        if self.wizard.error().is_some() {
            self.wizard.transition(WizardEvent::RetryBackup)?;
        }

        let api = Arc::clone(&self.api);
        let token = self.session_token.clone();
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            res = api.create_backup() => Some(res),
        };

        let Some(outcome) = outcome else {
            return Err(self.discard_cancelled());
        };

        match outcome {
            Ok(download) => {
                let created_at = Local::now();
                let filename = resolve_backup_filename(
                    download.content_disposition.as_deref(),
                    &self.options.filename_prefix,
                    created_at.naive_local(),
                );
                tracing::info!(
                    event = "restore.pre_backup",
                    filename = %filename,
                    bytes = download.bytes.len(),
                    "restore.pre_backup"
                );
                self.wizard
                    .transition(WizardEvent::BackupCreated(PreRestoreBackup {
                        bytes: download.bytes,
                        filename,
                        created_at,
                    }))?;
                self.wizard
                    .session()
                    .pre_backup
                    .as_ref()
                    .ok_or(Error::Cancelled)
            }
            Err(e) => {
                self.wizard
                    .transition(WizardEvent::BackupFailed(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Moves on to the challenge and returns its question.
    pub fn continue_to_challenge(&mut self) -> Result<String> {
        self.wizard.transition(WizardEvent::ContinueToChallenge)?;
        self.wizard
            .challenge()
            .map(|c| c.question.clone())
            .ok_or(Error::ChallengeFailed)
    }

    pub fn submit_answer(&mut self, input: &str) -> Result<()> {
        let step = self
            .wizard
            .transition(WizardEvent::SubmitAnswer(input.to_string()))?;
        if step == RestoreStep::SecurityChallenge {
            return Err(Error::ChallengeFailed);
        }
        Ok(())
    }

    /// Reads `path` as the backup to restore and validates it.
    pub async fn select_file(&mut self, path: &Path) -> Result<&BackupSummary> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match tokio::fs::read_to_string(path).await {
            Ok(text) => self.load_file(name, text),
            Err(e) => {
                self.wizard.transition(WizardEvent::FileUnreadable {
                    name,
                    message: e.to_string(),
                })?;
                Err(Error::Io(e))
            }
        }
    }

    pub fn load_file(&mut self, name: String, text: String) -> Result<&BackupSummary> {
        self.wizard
            .transition(WizardEvent::FileSelected { name, text })?;
        if let Some(message) = self.wizard.error() {
            return Err(Error::InvalidBackup {
                message: message.to_string(),
            });
        }
        self.wizard
            .session()
            .summary
            .as_ref()
            .ok_or_else(|| Error::InvalidBackup {
                message: "no hay resumen del respaldo".to_string(),
            })
    }

    pub fn continue_to_confirm(&mut self) -> Result<()> {
        self.wizard.transition(WizardEvent::ContinueToConfirm)?;
        Ok(())
    }

    /// Sends the selected file to the restore endpoint. Failure puts the
    /// wizard back on `final-confirm`; nothing is retried.
    pub async fn confirm_restore(&mut self) -> Result<()> {
        self.wizard.transition(WizardEvent::ConfirmRestore)?;
        let body = match &self.wizard.session().file {
            Some(file) => file.text.clone(),
            None => return Err(Error::Cancelled),
        };

        tracing::info!(event = "restore.submit", bytes = body.len(), "restore.submit");
        match self.api.restore_backup(body).await {
            Ok(()) => {
                self.wizard.transition(WizardEvent::RestoreSucceeded)?;
                tracing::info!(event = "restore.complete", "restore.complete");
                Ok(())
            }
            Err(e) => {
                self.wizard
                    .transition(WizardEvent::RestoreFailed(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Arms the post-restore reload. The timer is disarmed when the workflow
    /// is dropped or [`RestoreWorkflow::refresh_now`] runs first. The handle
    /// resolves to `true` if the reload fired.
    pub fn schedule_reload<R: Reloader + 'static>(
        &mut self,
        reloader: Arc<R>,
    ) -> Result<JoinHandle<bool>> {
        self.require_complete("schedule-reload")?;
        self.disarm_reload();

        let token = CancellationToken::new();
        self.reload_token = Some(token.clone());
        let delay = self.options.reload_delay;
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => {
                    tracing::info!(event = "restore.reload", trigger = "timer", "restore.reload");
                    reloader.reload();
                    true
                }
            }
        }))
    }

    pub fn refresh_now<R: Reloader + ?Sized>(&mut self, reloader: &R) -> Result<()> {
        self.require_complete("refresh-now")?;
        self.disarm_reload();
        tracing::info!(event = "restore.reload", trigger = "manual", "restore.reload");
        reloader.reload();
        self.finish()
    }

    /// Discards a completed session.
    pub fn finish(&mut self) -> Result<()> {
        self.wizard.transition(WizardEvent::Finish)?;
        self.disarm_reload();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.wizard.transition(WizardEvent::Cancel)?;
        self.session_token.cancel();
        tracing::info!(event = "restore.cancel", "restore.cancel");
        Ok(())
    }

    fn discard_cancelled(&mut self) -> Error {
        if self.wizard.step().is_cancellable() {
            let _ = self.wizard.transition(WizardEvent::Cancel);
        }
        tracing::info!(event = "restore.cancel", "restore.cancel");
        Error::Cancelled
    }

    fn require_complete(&self, event: &'static str) -> Result<()> {
        if self.wizard.step() != RestoreStep::Complete {
            return Err(Error::InvalidTransition {
                step: self.wizard.step(),
                event,
            });
        }
        Ok(())
    }

    fn disarm_reload(&mut self) {
        if let Some(token) = self.reload_token.take() {
            token.cancel();
        }
    }
}

impl<A: BackupApi> Drop for RestoreWorkflow<A> {
    fn drop(&mut self) {
        self.session_token.cancel();
        if let Some(token) = self.reload_token.take() {
            token.cancel();
        }
    }
}
