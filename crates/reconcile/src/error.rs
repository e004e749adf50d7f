use remote::RemoteError;
use store::{StoreError, UploadTicket};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("pending upload {0} has no stored binary")]
    MissingBlob(UploadTicket),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Worth retrying on a later pass without counting as a rejection
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
