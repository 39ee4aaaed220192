use thiserror::Error;

/// Main error type for the vigil supervision core
#[derive(Debug, Error)]
pub enum VigilError {
    // Channel-level errors, recoverable via reconnect
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    // Supervision errors
    #[error("No heartbeat from {0} within the allowed window")]
    SupervisionTimeout(String),

    #[error("Counterpart {0} self-reported a fatal failure")]
    SelfReportedFailure(String),

    #[error("Failed to spawn {0}: {1}")]
    Spawn(String, String),

    // Arbitration: a denial is an expected duplicate-instance signal,
    // not a fault; carried as an error only for access-level failures
    #[error("Instance arbitration failed: {0}")]
    Arbitration(String),

    // ProcessGuard: the OS refused the critical-process toggle
    #[error("Protection toggle failed: {0}")]
    ProtectionToggle(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;
