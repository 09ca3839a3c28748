use thiserror::Error;

/// Camera variants are shown to the user and end the scanning session; the
/// others are only logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("no cameras found")]
    NoCamera,
    /// Permission denial or hardware failure, carrying the browser's message.
    #[error("{0}")]
    CameraAccess(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid scanner config: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        ScanError::Config(e.to_string())
    }
}
