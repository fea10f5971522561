//! Error taxonomy shared by the collectors and the scanner.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single outbound API request.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection failure, timeout, or other transport-level error
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether retrying the same request may succeed.
    ///
    /// 403 and 429 are GitHub's rate-limit answers, so they count as transient.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Status { status, .. } => {
                *status >= 500 || *status == 403 || *status == 429
            }
            ApiError::Decode(_) => false,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ApiError::Decode(e.to_string());
        }
        let mut details = e.to_string();
        if e.is_timeout() {
            details.push_str(" [TIMEOUT]");
        } else if e.is_connect() {
            details.push_str(" [CONNECT]");
        }
        ApiError::Network(details)
    }
}

/// Structural problems that abort the whole invocation before work starts.
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("{path}: missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("not a directory: {0}")]
    InvalidDirectory(PathBuf),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Network("reset".into()).is_transient());
        assert!(ApiError::Status { status: 500, body: String::new() }.is_transient());
        assert!(ApiError::Status { status: 502, body: String::new() }.is_transient());
        assert!(ApiError::Status { status: 403, body: String::new() }.is_transient());
        assert!(ApiError::Status { status: 429, body: String::new() }.is_transient());

        assert!(!ApiError::Status { status: 422, body: String::new() }.is_transient());
        assert!(!ApiError::Status { status: 404, body: String::new() }.is_transient());
        assert!(!ApiError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn test_missing_column_message() {
        let err = MinerError::MissingColumn {
            path: PathBuf::from("repos.csv"),
            column: "full_name".into(),
        };
        assert_eq!(err.to_string(), "repos.csv: missing required column 'full_name'");
    }
}
