use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not replace database file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot access external source {source_ref}: {reason}")]
    ExternalAccess { source_ref: String, reason: String },

    #[error("Incompatible database, missing: {}", .missing.join(", "))]
    IncompatibleSchema { missing: Vec<String> },

    #[error("Copied database is empty")]
    EmptyCopy,

    #[error("An import is already running")]
    ImportInProgress,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Novel API error: {0}")]
    NarouApi(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn access(source_ref: impl Into<String>, reason: impl ToString) -> Self {
        AppError::ExternalAccess {
            source_ref: source_ref.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
