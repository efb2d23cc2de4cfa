use thiserror::Error;

use crate::file::{FileError, PageId};

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors that can occur during index operations
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("File error: {0}")]
    FileError(#[from] FileError),

    #[error("Corrupted node data at page {0}")]
    CorruptedNode(PageId),
}
