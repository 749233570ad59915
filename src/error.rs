use thiserror::Error;

/// Monitoring core error types
///
/// None of these ever reach the result of an instrumented business call; they
/// surface only through the core's own APIs (queries, reloads, sweeps).
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Wrapper-internal failure (parameter snapshot, event construction)
    #[error("Instrumentation failure in {function}: {message}")]
    Instrumentation { function: String, message: String },

    /// Store write failed after retries
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Configuration rejected by validation
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// A notification channel could not deliver an alert
    #[error("Delivery to channel '{channel}' failed: {message}")]
    ChannelDelivery { channel: String, message: String },

    /// No active or archived progress state for this session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Progress state machine rejected the transition
    #[error("Invalid transition for session {session_id}: {message}")]
    InvalidTransition { session_id: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl MonitorError {
    /// Short machine-readable kind, used as the `error_kind` label in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Instrumentation { .. } => "instrumentation_failure",
            Self::Persistence(_) => "persistence_failure",
            Self::ConfigValidation(_) => "config_validation_failure",
            Self::ChannelDelivery { .. } => "channel_delivery_failure",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Database(_) => "database",
            Self::Migration(_) => "migration",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Csv(_) => "csv",
            Self::Config(_) => "config",
            Self::Http(_) => "http",
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
