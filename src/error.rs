//! Error handling for the icsmap analysis pipeline
//!
//! Per-packet failures are counted, never propagated; the variants here
//! cover the setup and teardown paths where an error actually aborts.

use thiserror::Error;

/// Main error type for analysis operations
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Packet decode error: {0}")]
    DecodeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),

    #[error("Capture error: {0}")]
    CaptureError(String),

    #[error("Output error: {0}")]
    OutputError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<std::net::AddrParseError> for AnalysisError {
    fn from(e: std::net::AddrParseError) -> Self {
        AnalysisError::ConfigError(e.to_string())
    }
}

impl From<toml::de::Error> for AnalysisError {
    fn from(e: toml::de::Error) -> Self {
        AnalysisError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "need root");
        let err: AnalysisError = io.into();
        assert!(matches!(err, AnalysisError::IoError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = AnalysisError::ConfigError("workers must be > 0".to_string());
        assert_eq!(err.to_string(), "Configuration error: workers must be > 0");
    }

    #[test]
    fn test_capture_and_output_error_display() {
        let err = AnalysisError::CaptureError("unsupported channel type on eth0".to_string());
        assert_eq!(
            err.to_string(),
            "Capture error: unsupported channel type on eth0"
        );

        let err = AnalysisError::OutputError("writing report to model.json: denied".to_string());
        assert_eq!(
            err.to_string(),
            "Output error: writing report to model.json: denied"
        );
    }
}
