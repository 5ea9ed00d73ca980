mod api;
mod backup_file;
mod challenge;
pub mod config;
mod error;
pub mod filename;
pub mod run_log;
pub mod wizard;
pub mod workflow;

pub const APP_NAME: &str = "thesisflow-admin";

pub use api::{BackupApi, BackupDownload, HttpBackupApi, InMemoryBackupApi, extract_error_message};
pub use backup_file::{
    BackupSummary, REQUIRED_TABLES, TableSummary, build_backup_summary, inspect_backup_text,
    parse_backup_text, validate_backup_structure,
};
pub use challenge::Challenge;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use wizard::{RestoreStep, RestoreWizard, WizardEvent, WizardSnapshot};
pub use workflow::{Reloader, RestoreWorkflow, WorkflowOptions};
