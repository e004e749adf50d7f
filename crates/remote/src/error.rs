use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connectivity problem; the item stays pending and is retried
    #[error("network error: {0}")]
    Network(String),

    /// The server refused the write or query
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode remote response: {0}")]
    Decode(String),

    #[error("field mapping failed: {0}")]
    Mapping(String),

    #[error("remote not configured: {0}")]
    Config(String),
}

impl RemoteError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Decode(_) | Self::Mapping(_) | Self::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Rejected { status: 503, message: String::new() }.is_transient());
        assert!(RemoteError::Rejected { status: 429, message: String::new() }.is_transient());
        assert!(!RemoteError::Rejected { status: 400, message: String::new() }.is_transient());
        assert!(!RemoteError::Mapping("x".into()).is_transient());
    }
}
