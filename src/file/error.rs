use std::io;
use thiserror::Error;

use super::PageId;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid page id: {0}")]
    InvalidPageId(PageId),

    #[error("Page not found: page_id={0}")]
    PageNotFound(PageId),

    #[error("Buffer pool is full")]
    BufferPoolFull,
}

pub type FileResult<T> = Result<T, FileError>;
