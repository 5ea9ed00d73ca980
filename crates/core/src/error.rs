use crate::wizard::RestoreStep;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Http { message: String },

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("{message}")]
    InvalidBackup { message: String },

    #[error("respuesta incorrecta")]
    ChallengeFailed,

    #[error("invalid transition: {event} is not allowed in step {step}")]
    InvalidTransition {
        step: RestoreStep,
        event: &'static str,
    },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Backend and transport failures are worth another attempt; everything
    /// else needs the user to change something first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http { .. } => true,
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
