/// Centralized error types for the candle pipeline and index engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    // Network Errors
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("WebSocket connection failed: {0}")]
    WebSocketError(String),

    #[error("Exchange API error: {code} - {message}")]
    ExchangeApiError { code: i64, message: String },

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    // Data Errors
    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // State Errors
    #[error("Missing state: {0}")]
    MissingState(String),

    #[error("Symbol is not active: {0}")]
    InactiveSymbol(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Generic Errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Errors that are retried on the next cycle instead of surfacing
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IndexError::HttpError(_)
                | IndexError::WebSocketError(_)
                | IndexError::ExchangeApiError { .. }
                | IndexError::RateLimitExceeded(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            IndexError::HttpError(_) => "NET_001",
            IndexError::WebSocketError(_) => "NET_002",
            IndexError::ExchangeApiError { .. } => "NET_003",
            IndexError::RateLimitExceeded(_) => "NET_004",
            IndexError::MissingData(_) => "DATA_001",
            IndexError::DeserializationError(_) => "DATA_002",
            IndexError::MissingState(_) => "STATE_001",
            IndexError::InactiveSymbol(_) => "STATE_002",
            IndexError::ConfigError(_) => "CFG_001",
            IndexError::FileError(_) => "FILE_001",
            IndexError::InternalError(_) => "INT_001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(IndexError::RateLimitExceeded("too many visits".to_string()).is_recoverable());
        assert!(IndexError::ExchangeApiError { code: 10006, message: "too many visits".to_string() }
            .is_recoverable());
        assert!(!IndexError::MissingState("loadlog15.txt".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(IndexError::MissingState(String::new()).error_code(), "STATE_001");
        assert_eq!(IndexError::MissingData(String::new()).error_code(), "DATA_001");
    }
}
