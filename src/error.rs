//! Error types for q4d.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration file {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MQTT broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection to {host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Transfer executor errors. All of them are scoped to a single job.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("No destination configured for code {code}")]
    NoDestination { code: String },

    #[error("Transfer tool {tool} not found on PATH")]
    ToolMissing { tool: String },

    #[error("Refusing to pass {what} containing a line break or NUL to the transfer tool")]
    UnsafeArgument { what: String },

    #[error("Failed to start {mode} transfer: {reason}")]
    SpawnFailed { mode: String, reason: String },

    #[error("IO error while running transfer: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while processing one dequeued job.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job {name:?} failed: {source}")]
    Transfer {
        name: String,
        #[source]
        source: TransferError,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
