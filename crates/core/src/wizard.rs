//! Restore-from-backup wizard.
//!
//! The wizard is a plain state machine: every user action or network
//! outcome is fed in as a [`WizardEvent`] through [`RestoreWizard::transition`],
//! and subscribers get a [`WizardSnapshot`] after each accepted change. It
//! performs no I/O itself; see [`crate::workflow`] for the async driver.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::backup_file::{BackupSummary, inspect_backup_text};
use crate::challenge::Challenge;
use crate::{Error, Result};

const WRONG_ANSWER: &str = "Respuesta incorrecta. Inténtalo de nuevo.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreStep {
    #[default]
    Idle,
    Warning,
    AutoBackup,
    SecurityChallenge,
    FileUpload,
    FinalConfirm,
    Restoring,
    Complete,
}

impl RestoreStep {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreStep::Idle => "idle",
            RestoreStep::Warning => "warning",
            RestoreStep::AutoBackup => "auto-backup",
            RestoreStep::SecurityChallenge => "security-challenge",
            RestoreStep::FileUpload => "file-upload",
            RestoreStep::FinalConfirm => "final-confirm",
            RestoreStep::Restoring => "restoring",
            RestoreStep::Complete => "complete",
        }
    }

    /// Steps from which the user may still back out.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            RestoreStep::Warning
                | RestoreStep::AutoBackup
                | RestoreStep::SecurityChallenge
                | RestoreStep::FileUpload
                | RestoreStep::FinalConfirm
        )
    }
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Safety export taken right before the destructive call.
#[derive(Debug, Clone)]
pub struct PreRestoreBackup {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub created_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreSession {
    pub step: RestoreStep,
    pub pre_backup: Option<PreRestoreBackup>,
    pub challenge: Option<Challenge>,
    pub file: Option<SelectedFile>,
    pub summary: Option<BackupSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum WizardEvent {
    Start,
    ConfirmRisk,
    BackupCreated(PreRestoreBackup),
    BackupFailed(String),
    RetryBackup,
    ContinueToChallenge,
    SubmitAnswer(String),
    FileSelected { name: String, text: String },
    FileUnreadable { name: String, message: String },
    ContinueToConfirm,
    ConfirmRestore,
    RestoreSucceeded,
    RestoreFailed(String),
    Finish,
    Cancel,
}

impl WizardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WizardEvent::Start => "start",
            WizardEvent::ConfirmRisk => "confirm-risk",
            WizardEvent::BackupCreated(_) => "backup-created",
            WizardEvent::BackupFailed(_) => "backup-failed",
            WizardEvent::RetryBackup => "retry-backup",
            WizardEvent::ContinueToChallenge => "continue-to-challenge",
            WizardEvent::SubmitAnswer(_) => "submit-answer",
            WizardEvent::FileSelected { .. } => "file-selected",
            WizardEvent::FileUnreadable { .. } => "file-unreadable",
            WizardEvent::ContinueToConfirm => "continue-to-confirm",
            WizardEvent::ConfirmRestore => "confirm-restore",
            WizardEvent::RestoreSucceeded => "restore-succeeded",
            WizardEvent::RestoreFailed(_) => "restore-failed",
            WizardEvent::Finish => "finish",
            WizardEvent::Cancel => "cancel",
        }
    }
}

/// What a front-end needs to render the current step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardSnapshot {
    pub step: RestoreStep,
    pub pre_backup_filename: Option<String>,
    pub pre_backup_created_at: Option<String>,
    pub challenge_question: Option<String>,
    pub file_name: Option<String>,
    pub summary: Option<BackupSummary>,
    pub error: Option<String>,
}

pub type Listener = Box<dyn Fn(&WizardSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

#[derive(Default)]
pub struct RestoreWizard {
    session: RestoreSession,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

impl fmt::Debug for RestoreWizard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreWizard")
            .field("session", &self.session)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl RestoreWizard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> RestoreStep {
        self.session.step
    }

    pub fn session(&self) -> &RestoreSession {
        &self.session
    }

    pub fn challenge(&self) -> Option<&Challenge> {
        self.session.challenge.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.session.error.as_deref()
    }

    pub fn snapshot(&self) -> WizardSnapshot {
        let s = &self.session;
        WizardSnapshot {
            step: s.step,
            pre_backup_filename: s.pre_backup.as_ref().map(|b| b.filename.clone()),
            pre_backup_created_at: s.pre_backup.as_ref().map(|b| b.created_at.to_rfc3339()),
            challenge_question: s.challenge.as_ref().map(|c| c.question.clone()),
            file_name: s.file.as_ref().map(|f| f.name.clone()),
            summary: s.summary.clone(),
            error: s.error.clone(),
        }
    }

    pub fn subscribe(
        &mut self,
        listener: impl Fn(&WizardSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        Subscription(id)
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(id, _)| *id != subscription.0);
        self.listeners.len() != before
    }

    /// Applies one event. Rejected events leave the session untouched.
    ///
    /// Recoverable failures (wrong answer, invalid file, backend error) are
    /// accepted transitions that keep the step and set the inline error.
    pub fn transition(&mut self, event: WizardEvent) -> Result<RestoreStep> {
        let step = self.session.step;
        let event_name = event.name();
        let rejected = || Error::InvalidTransition {
            step,
            event: event_name,
        };

        match (step, event) {
            (RestoreStep::Idle, WizardEvent::Start) => {
                self.session = RestoreSession {
                    step: RestoreStep::Warning,
                    ..Default::default()
                };
            }
            (RestoreStep::Idle, WizardEvent::Cancel) => return Ok(step),
            (s, WizardEvent::Cancel) if s.is_cancellable() => {
                self.session = RestoreSession::default();
            }
            (RestoreStep::Warning, WizardEvent::ConfirmRisk) => {
                self.session.step = RestoreStep::AutoBackup;
                self.session.error = None;
            }
            (RestoreStep::AutoBackup, WizardEvent::BackupCreated(backup)) => {
                if self.session.pre_backup.is_some() {
                    return Err(rejected());
                }
                self.session.pre_backup = Some(backup);
                self.session.error = None;
            }
            (RestoreStep::AutoBackup, WizardEvent::BackupFailed(message)) => {
                if self.session.pre_backup.is_some() {
                    return Err(rejected());
                }
                self.session.error = Some(message);
            }
            (RestoreStep::AutoBackup, WizardEvent::RetryBackup) => {
                if self.session.pre_backup.is_some() {
                    return Err(rejected());
                }
                self.session.error = None;
            }
            (RestoreStep::AutoBackup, WizardEvent::ContinueToChallenge) => {
                if self.session.pre_backup.is_none() {
                    return Err(rejected());
                }
                self.session.step = RestoreStep::SecurityChallenge;
                self.session.challenge = Some(Challenge::random());
                self.session.error = None;
            }
            (RestoreStep::SecurityChallenge, WizardEvent::SubmitAnswer(input)) => {
                let passed = self
                    .session
                    .challenge
                    .as_ref()
                    .is_some_and(|c| c.matches(&input));
                if passed {
                    self.session.step = RestoreStep::FileUpload;
                    self.session.error = None;
                } else {
                    self.session.error = Some(WRONG_ANSWER.to_string());
                }
            }
            (RestoreStep::FileUpload, WizardEvent::FileSelected { name, text }) => {
                match inspect_backup_text(&text) {
                    Ok(summary) => {
                        self.session.file = Some(SelectedFile { name, text });
                        self.session.summary = Some(summary);
                        self.session.error = None;
                    }
                    Err(e) => {
                        self.session.file = None;
                        self.session.summary = None;
                        self.session.error = Some(e.to_string());
                    }
                }
            }
            (RestoreStep::FileUpload, WizardEvent::FileUnreadable { name, message }) => {
                self.session.file = None;
                self.session.summary = None;
                self.session.error = Some(format!("no se pudo leer \"{name}\": {message}"));
            }
            (RestoreStep::FileUpload, WizardEvent::ContinueToConfirm) => {
                if self.session.summary.is_none() {
                    return Err(rejected());
                }
                self.session.step = RestoreStep::FinalConfirm;
                self.session.error = None;
            }
            (RestoreStep::FinalConfirm, WizardEvent::ConfirmRestore) => {
                if self.session.file.is_none() {
                    return Err(rejected());
                }
                self.session.step = RestoreStep::Restoring;
                self.session.error = None;
            }
            (RestoreStep::Restoring, WizardEvent::RestoreSucceeded) => {
                self.session.step = RestoreStep::Complete;
                self.session.error = None;
            }
            (RestoreStep::Restoring, WizardEvent::RestoreFailed(message)) => {
                self.session.step = RestoreStep::FinalConfirm;
                self.session.error = Some(message);
            }
            (RestoreStep::Complete, WizardEvent::Finish) => {
                self.session = RestoreSession::default();
            }
            _ => return Err(rejected()),
        }

        let next = self.session.step;
        tracing::debug!(
            event = "restore.transition",
            from = step.as_str(),
            to = next.as_str(),
            trigger = event_name,
            "restore.transition"
        );
        if let Some(message) = &self.session.error {
            tracing::warn!(
                event = "restore.error",
                step = next.as_str(),
                error = %message,
                "restore.error"
            );
        }
        self.notify();
        Ok(next)
    }

    fn notify(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for (_, listener) in &self.listeners {
            listener(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::backup_file::REQUIRED_TABLES;

    fn all_events() -> Vec<WizardEvent> {
        vec![
            WizardEvent::Start,
            WizardEvent::ConfirmRisk,
            WizardEvent::BackupCreated(pre_backup()),
            WizardEvent::BackupFailed("x".to_string()),
            WizardEvent::RetryBackup,
            WizardEvent::ContinueToChallenge,
            WizardEvent::SubmitAnswer("1".to_string()),
            WizardEvent::FileSelected {
                name: "a.json".to_string(),
                text: valid_text(),
            },
            WizardEvent::FileUnreadable {
                name: "a.json".to_string(),
                message: "x".to_string(),
            },
            WizardEvent::ContinueToConfirm,
            WizardEvent::ConfirmRestore,
            WizardEvent::RestoreSucceeded,
            WizardEvent::RestoreFailed("x".to_string()),
            WizardEvent::Finish,
            WizardEvent::Cancel,
        ]
    }

    fn pre_backup() -> PreRestoreBackup {
        PreRestoreBackup {
            bytes: b"{}".to_vec(),
            filename: "pre.json".to_string(),
            created_at: Local::now(),
        }
    }

    fn valid_text() -> String {
        let mut doc = serde_json::Map::new();
        for table in REQUIRED_TABLES {
            doc.insert(table.to_string(), serde_json::json!([]));
        }
        doc.insert("career".to_string(), serde_json::json!([1, 2]));
        serde_json::Value::Object(doc).to_string()
    }

    fn answer(w: &RestoreWizard) -> String {
        w.challenge().expect("challenge").answer.to_string()
    }

    fn advance_to(w: &mut RestoreWizard, target: RestoreStep) {
        let path = [
            (RestoreStep::Warning, vec![WizardEvent::Start]),
            (RestoreStep::AutoBackup, vec![WizardEvent::ConfirmRisk]),
            (
                RestoreStep::SecurityChallenge,
                vec![
                    WizardEvent::BackupCreated(pre_backup()),
                    WizardEvent::ContinueToChallenge,
                ],
            ),
            (RestoreStep::FileUpload, vec![]),
            (
                RestoreStep::FinalConfirm,
                vec![
                    WizardEvent::FileSelected {
                        name: "a.json".to_string(),
                        text: valid_text(),
                    },
                    WizardEvent::ContinueToConfirm,
                ],
            ),
            (RestoreStep::Restoring, vec![WizardEvent::ConfirmRestore]),
            (RestoreStep::Complete, vec![WizardEvent::RestoreSucceeded]),
        ];
        for (step, events) in path {
            if step == RestoreStep::FileUpload {
                let a = answer(w);
                w.transition(WizardEvent::SubmitAnswer(a)).unwrap();
            }
            for e in events {
                w.transition(e).unwrap();
            }
            assert_eq!(w.step(), step);
            if step == target {
                return;
            }
        }
    }

    #[test]
    fn from_idle_only_warning_is_reachable() {
        for event in all_events() {
            let mut w = RestoreWizard::new();
            let name = event.name();
            let result = w.transition(event);
            match name {
                "start" => assert_eq!(result.unwrap(), RestoreStep::Warning),
                _ => assert_eq!(w.step(), RestoreStep::Idle, "{name} left idle"),
            }
        }
    }

    #[test]
    fn happy_path_reaches_complete_through_restoring() {
        let mut w = RestoreWizard::new();
        advance_to(&mut w, RestoreStep::Restoring);
        assert_eq!(
            w.transition(WizardEvent::RestoreSucceeded).unwrap(),
            RestoreStep::Complete
        );
        assert_eq!(w.session().summary.as_ref().unwrap().total_records, 2);
        assert_eq!(w.transition(WizardEvent::Finish).unwrap(), RestoreStep::Idle);
        assert!(w.session().file.is_none());
    }

    #[test]
    fn complete_is_only_reachable_from_restoring() {
        for target in [
            RestoreStep::Warning,
            RestoreStep::AutoBackup,
            RestoreStep::SecurityChallenge,
            RestoreStep::FileUpload,
            RestoreStep::FinalConfirm,
        ] {
            for event in all_events() {
                let mut w = RestoreWizard::new();
                advance_to(&mut w, target);
                let _ = w.transition(event);
                assert_ne!(w.step(), RestoreStep::Complete, "from {target}");
            }
        }
    }

    #[test]
    fn cancel_from_any_open_step_clears_session() {
        for target in [
            RestoreStep::Warning,
            RestoreStep::AutoBackup,
            RestoreStep::SecurityChallenge,
            RestoreStep::FileUpload,
            RestoreStep::FinalConfirm,
        ] {
            let mut w = RestoreWizard::new();
            advance_to(&mut w, target);
            assert_eq!(w.transition(WizardEvent::Cancel).unwrap(), RestoreStep::Idle);
            let s = w.session();
            assert!(s.pre_backup.is_none());
            assert!(s.challenge.is_none());
            assert!(s.file.is_none());
            assert!(s.summary.is_none());
            assert!(s.error.is_none());
        }
    }

    #[test]
    fn cancel_is_rejected_while_restoring_or_complete() {
        for target in [RestoreStep::Restoring, RestoreStep::Complete] {
            let mut w = RestoreWizard::new();
            advance_to(&mut w, target);
            let err = w.transition(WizardEvent::Cancel).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));
            assert_eq!(w.step(), target);
        }
    }

    #[test]
    fn backup_failure_stays_and_can_retry() {
        let mut w = RestoreWizard::new();
        advance_to(&mut w, RestoreStep::AutoBackup);

        w.transition(WizardEvent::BackupFailed("HTTP 500".to_string()))
            .unwrap();
        assert_eq!(w.step(), RestoreStep::AutoBackup);
        assert_eq!(w.error(), Some("HTTP 500"));
        assert!(w.transition(WizardEvent::ContinueToChallenge).is_err());

        w.transition(WizardEvent::RetryBackup).unwrap();
        assert_eq!(w.error(), None);
        w.transition(WizardEvent::BackupCreated(pre_backup())).unwrap();
        w.transition(WizardEvent::ContinueToChallenge).unwrap();
        assert_eq!(w.step(), RestoreStep::SecurityChallenge);
    }

    #[test]
    fn wrong_answer_keeps_challenge_step() {
        let mut w = RestoreWizard::new();
        advance_to(&mut w, RestoreStep::SecurityChallenge);
        let wrong = (w.challenge().unwrap().answer + 1).to_string();

        for input in [wrong.as_str(), "abc", ""] {
            w.transition(WizardEvent::SubmitAnswer(input.to_string()))
                .unwrap();
            assert_eq!(w.step(), RestoreStep::SecurityChallenge);
            assert_eq!(w.error(), Some(WRONG_ANSWER));
        }

        let right = answer(&w);
        w.transition(WizardEvent::SubmitAnswer(right)).unwrap();
        assert_eq!(w.step(), RestoreStep::FileUpload);
        assert_eq!(w.error(), None);
    }

    #[test]
    fn invalid_file_blocks_confirmation() {
        let mut w = RestoreWizard::new();
        advance_to(&mut w, RestoreStep::FileUpload);

        w.transition(WizardEvent::FileSelected {
            name: "bad.json".to_string(),
            text: r#"{"career":[]}"#.to_string(),
        })
        .unwrap();
        assert_eq!(w.step(), RestoreStep::FileUpload);
        assert!(w.error().unwrap().contains("person"));
        assert!(w.transition(WizardEvent::ContinueToConfirm).is_err());

        w.transition(WizardEvent::FileUnreadable {
            name: "gone.json".to_string(),
            message: "not found".to_string(),
        })
        .unwrap();
        assert!(w.error().unwrap().contains("gone.json"));

        w.transition(WizardEvent::FileSelected {
            name: "good.json".to_string(),
            text: valid_text(),
        })
        .unwrap();
        assert_eq!(w.error(), None);
        w.transition(WizardEvent::ContinueToConfirm).unwrap();
        assert_eq!(w.step(), RestoreStep::FinalConfirm);
    }

    #[test]
    fn restore_failure_returns_to_final_confirm() {
        let mut w = RestoreWizard::new();
        advance_to(&mut w, RestoreStep::Restoring);
        w.transition(WizardEvent::RestoreFailed("boom".to_string()))
            .unwrap();
        assert_eq!(w.step(), RestoreStep::FinalConfirm);
        assert_eq!(w.error(), Some("boom"));
        assert!(w.session().file.is_some());
    }

    #[test]
    fn each_entry_into_challenge_draws_a_fresh_one() {
        let mut w = RestoreWizard::new();
        advance_to(&mut w, RestoreStep::SecurityChallenge);
        assert!(w.challenge().is_some());
        w.transition(WizardEvent::Cancel).unwrap();
        assert!(w.challenge().is_none());
        advance_to(&mut w, RestoreStep::SecurityChallenge);
        assert!(w.challenge().is_some());
    }

    #[test]
    fn subscribers_see_every_accepted_transition() {
        let seen: Arc<Mutex<Vec<RestoreStep>>> = Arc::default();
        let mut w = RestoreWizard::new();
        let sink = Arc::clone(&seen);
        let sub = w.subscribe(move |s| sink.lock().unwrap().push(s.step));

        w.transition(WizardEvent::Start).unwrap();
        let _ = w.transition(WizardEvent::Finish);
        w.transition(WizardEvent::ConfirmRisk).unwrap();
        assert!(w.unsubscribe(sub));
        assert!(!w.unsubscribe(sub));
        w.transition(WizardEvent::Cancel).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![RestoreStep::Warning, RestoreStep::AutoBackup]
        );
    }

    #[test]
    fn snapshot_hides_the_answer() {
        let mut w = RestoreWizard::new();
        advance_to(&mut w, RestoreStep::SecurityChallenge);
        let json = serde_json::to_value(w.snapshot()).unwrap();
        assert_eq!(json["step"], "security-challenge");
        assert!(json["challengeQuestion"].is_string());
        assert!(json.get("answer").is_none());
        assert_eq!(json["preBackupFilename"], "pre.json");
    }
}
