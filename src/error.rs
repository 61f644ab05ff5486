use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("scm unavailable: {0}")]
    ScmUnavailable(String),

    #[error("config file missing: {0}")]
    ConfigMissing(String),

    #[error("invalid config at line {line}, column {column}: {message}")]
    ConfigInvalid {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("worker unreachable: {0}")]
    WorkerUnreachable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
