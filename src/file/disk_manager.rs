use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::error::{FileError, FileResult};
use super::{PAGE_SIZE, PageId};

/// Maps logical pages to byte offsets in a single backing file
///
/// Page `k` lives at offset `k * PAGE_SIZE`. Allocation hands out the next
/// identifier past the end of the file; the file itself grows when that page
/// is first written. No fsync is issued anywhere in this layer.
pub struct DiskManager {
    file: File,
    num_pages: PageId,
}

impl DiskManager {
    /// Open the backing file, creating it if absent
    pub fn open<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as PageId;

        Ok(Self { file, num_pages })
    }

    /// Read a page into `buffer`; bytes past the end of the file read as zeros
    pub fn read_page(&mut self, page_id: PageId, buffer: &mut [u8; PAGE_SIZE]) -> FileResult<()> {
        if page_id < 0 {
            return Err(FileError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = self.file.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer[filled..].fill(0);

        Ok(())
    }

    /// Write a full page at its offset
    pub fn write_page(&mut self, page_id: PageId, buffer: &[u8; PAGE_SIZE]) -> FileResult<()> {
        if page_id < 0 {
            return Err(FileError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buffer)?;

        Ok(())
    }

    /// Hand out the next page identifier
    ///
    /// Pure counter bump: nothing is written until the page is flushed.
    pub fn allocate_page(&mut self) -> PageId {
        let page_id = self.num_pages;
        self.num_pages += 1;
        page_id
    }

    /// Cached page count, set at open time and advanced by allocation
    pub fn num_pages(&self) -> PageId {
        self.num_pages
    }
}
