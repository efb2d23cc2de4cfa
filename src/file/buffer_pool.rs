use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use log::trace;
use lru::LruCache;

use super::disk_manager::DiskManager;
use super::error::{FileError, FileResult};
use super::{INVALID_PAGE_ID, PAGE_SIZE, PageId};

/// Index of a frame inside the pool
pub type FrameId = usize;

/// A buffer slot holding one page worth of bytes
struct Frame {
    page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
    is_dirty: bool,
    pin_count: u32,
}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            data: Box::new([0u8; PAGE_SIZE]),
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Pin-counted page cache over a fixed set of frames
///
/// Pages are fetched pinned and stay evictable only while their pin count is
/// zero. Pin counting matters even single-threaded: one logical index
/// operation can hold several pages at once while forcing eviction of others.
/// Victims come from the free list first, then from the least-recently-
/// unpinned end of the LRU cache, which holds exactly the unpinned frames.
pub struct BufferPool {
    disk: DiskManager,
    frames: Vec<Frame>,
    /// Resident pages: page_id -> frame index
    page_table: HashMap<PageId, FrameId>,
    /// Frames never yet bound or explicitly freed, consumed front-first
    free_list: VecDeque<FrameId>,
    /// Frames whose resident page is unpinned, most recently unpinned first
    lru: LruCache<FrameId, ()>,
}

impl BufferPool {
    /// Create a pool of `pool_size` empty frames over the given disk manager
    pub fn new(disk: DiskManager, pool_size: usize) -> Self {
        Self {
            disk,
            frames: (0..pool_size).map(|_| Frame::new()).collect(),
            page_table: HashMap::new(),
            free_list: (0..pool_size).collect(),
            lru: LruCache::new(NonZeroUsize::new(pool_size).unwrap()),
        }
    }

    /// Fetch a page, pinning it
    ///
    /// Resident pages just gain a pin. Otherwise a victim frame is found,
    /// written back if dirty, and reloaded from disk. Fails with
    /// `BufferPoolFull` when every frame is pinned.
    pub fn fetch_page(&mut self, page_id: PageId) -> FileResult<FrameId> {
        if page_id < 0 {
            return Err(FileError::InvalidPageId(page_id));
        }

        if let Some(&frame_id) = self.page_table.get(&page_id) {
            if self.frames[frame_id].pin_count == 0 {
                self.lru.pop(&frame_id);
            }
            self.frames[frame_id].pin_count += 1;
            return Ok(frame_id);
        }

        let frame_id = self.find_victim()?;
        self.evict(frame_id)?;

        let frame = &mut self.frames[frame_id];
        self.disk.read_page(page_id, &mut frame.data)?;
        frame.page_id = page_id;
        frame.is_dirty = false;
        frame.pin_count = 1;
        self.page_table.insert(page_id, frame_id);

        Ok(frame_id)
    }

    /// Allocate a fresh page and pin it in a zeroed frame
    pub fn new_page(&mut self) -> FileResult<(PageId, FrameId)> {
        let frame_id = self.find_victim()?;
        self.evict(frame_id)?;

        let page_id = self.disk.allocate_page();
        trace!("allocated page {page_id}");

        let frame = &mut self.frames[frame_id];
        frame.data.fill(0);
        frame.page_id = page_id;
        frame.is_dirty = false;
        frame.pin_count = 1;
        self.page_table.insert(page_id, frame_id);

        Ok((page_id, frame_id))
    }

    /// Drop one pin, recording whether the holder modified the page
    ///
    /// The dirty flag is sticky: once any unpinner reports dirty, the page
    /// stays dirty until written back. Returns false if the page is not
    /// resident or has no pins outstanding.
    pub fn unpin_page(&mut self, page_id: PageId, mark_dirty: bool) -> bool {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return false;
        };

        let frame = &mut self.frames[frame_id];
        if frame.pin_count == 0 {
            return false;
        }

        frame.pin_count -= 1;
        if mark_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            self.lru.put(frame_id, ());
        }

        true
    }

    /// Write a resident page to disk, clean or not, and clear its dirty flag
    pub fn flush_page(&mut self, page_id: PageId) -> FileResult<()> {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return Err(FileError::PageNotFound(page_id));
        };

        let frame = &mut self.frames[frame_id];
        self.disk.write_page(frame.page_id, &frame.data)?;
        frame.is_dirty = false;

        Ok(())
    }

    /// Drop a page from the pool without writing it back
    ///
    /// Succeeds trivially when the page is not resident; refuses when it is
    /// pinned. The freed frame returns to the free list.
    pub fn delete_page(&mut self, page_id: PageId) -> bool {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return true;
        };

        if self.frames[frame_id].pin_count > 0 {
            return false;
        }

        self.lru.pop(&frame_id);
        self.page_table.remove(&page_id);

        let frame = &mut self.frames[frame_id];
        frame.page_id = INVALID_PAGE_ID;
        frame.is_dirty = false;
        self.free_list.push_back(frame_id);

        true
    }

    /// Write back every resident dirty page, clearing dirty flags
    pub fn flush_all_pages(&mut self) -> FileResult<()> {
        for frame in &mut self.frames {
            if frame.page_id != INVALID_PAGE_ID && frame.is_dirty {
                self.disk.write_page(frame.page_id, &frame.data)?;
                frame.is_dirty = false;
            }
        }

        Ok(())
    }

    /// Bytes of a pinned frame
    pub fn frame(&self, frame_id: FrameId) -> &[u8; PAGE_SIZE] {
        &self.frames[frame_id].data
    }

    /// Mutable bytes of a pinned frame
    ///
    /// Dirtiness is declared at unpin time, not at borrow time.
    pub fn frame_mut(&mut self, frame_id: FrameId) -> &mut [u8; PAGE_SIZE] {
        &mut self.frames[frame_id].data
    }

    /// Identifier of the page resident in a frame
    pub fn frame_page_id(&self, frame_id: FrameId) -> PageId {
        self.frames[frame_id].page_id
    }

    /// Page count of the underlying file, as cached by the disk manager
    pub fn num_pages(&self) -> PageId {
        self.disk.num_pages()
    }

    /// Whether a page currently occupies a frame
    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.page_table.contains_key(&page_id)
    }

    /// Pin count of a resident page
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.page_table
            .get(&page_id)
            .map(|&frame_id| self.frames[frame_id].pin_count)
    }

    /// Number of resident dirty pages
    pub fn dirty_page_count(&self) -> usize {
        self.frames.iter().filter(|f| f.is_dirty).count()
    }

    /// Free list front, then LRU tail; only unpinned pages are candidates
    fn find_victim(&mut self) -> FileResult<FrameId> {
        if let Some(frame_id) = self.free_list.pop_front() {
            return Ok(frame_id);
        }
        if let Some((frame_id, ())) = self.lru.pop_lru() {
            return Ok(frame_id);
        }
        Err(FileError::BufferPoolFull)
    }

    /// Unbind a victim frame, writing its page back first if dirty
    fn evict(&mut self, frame_id: FrameId) -> FileResult<()> {
        let frame = &mut self.frames[frame_id];
        if frame.page_id != INVALID_PAGE_ID {
            if frame.is_dirty {
                trace!("evicting dirty page {}", frame.page_id);
                self.disk.write_page(frame.page_id, &frame.data)?;
                frame.is_dirty = false;
            }
            self.page_table.remove(&frame.page_id);
            frame.page_id = INVALID_PAGE_ID;
        }
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // Best-effort write-back when the pool goes away
        let _ = self.flush_all_pages();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_pool(pool_size: usize) -> (TempDir, BufferPool) {
        let temp_dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(temp_dir.path().join("test.db")).unwrap();
        (temp_dir, BufferPool::new(disk, pool_size))
    }

    #[test]
    fn test_new_page_zeroed_and_sequential() {
        let (_temp_dir, mut pool) = setup_pool(4);

        let (page_id, frame_id) = pool.new_page().unwrap();
        assert_eq!(page_id, 0);
        assert!(pool.frame(frame_id).iter().all(|&b| b == 0));

        let (page_id, _) = pool.new_page().unwrap();
        assert_eq!(page_id, 1);
    }

    #[test]
    fn test_fetch_pins_and_unpin_releases() {
        let (_temp_dir, mut pool) = setup_pool(4);

        let (page_id, _) = pool.new_page().unwrap();
        assert_eq!(pool.pin_count(page_id), Some(1));

        pool.fetch_page(page_id).unwrap();
        assert_eq!(pool.pin_count(page_id), Some(2));

        assert!(pool.unpin_page(page_id, false));
        assert!(pool.unpin_page(page_id, false));
        assert_eq!(pool.pin_count(page_id), Some(0));

        // Already at zero pins
        assert!(!pool.unpin_page(page_id, false));
        // Not resident at all
        assert!(!pool.unpin_page(999, false));
    }

    #[test]
    fn test_dirty_flag_is_sticky() {
        let (_temp_dir, mut pool) = setup_pool(4);

        let (page_id, _) = pool.new_page().unwrap();
        pool.fetch_page(page_id).unwrap();

        assert!(pool.unpin_page(page_id, true));
        assert!(pool.unpin_page(page_id, false));
        assert_eq!(pool.dirty_page_count(), 1);
    }

    #[test]
    fn test_all_frames_pinned_reports_full() {
        let (_temp_dir, mut pool) = setup_pool(2);

        pool.new_page().unwrap();
        pool.new_page().unwrap();

        assert!(matches!(pool.new_page(), Err(FileError::BufferPoolFull)));
        assert!(matches!(
            pool.fetch_page(50),
            Err(FileError::BufferPoolFull)
        ));
    }

    #[test]
    fn test_lru_evicts_least_recently_unpinned() {
        let (_temp_dir, mut pool) = setup_pool(3);

        let (p0, _) = pool.new_page().unwrap();
        let (p1, _) = pool.new_page().unwrap();
        let (p2, _) = pool.new_page().unwrap();

        pool.unpin_page(p0, false);
        pool.unpin_page(p1, false);
        pool.unpin_page(p2, false);

        // Touch p0 so p1 becomes the LRU tail
        pool.fetch_page(p0).unwrap();
        pool.unpin_page(p0, false);

        let (p3, _) = pool.new_page().unwrap();
        assert!(pool.is_resident(p0));
        assert!(!pool.is_resident(p1));
        assert!(pool.is_resident(p2));
        assert!(pool.is_resident(p3));
    }

    #[test]
    fn test_pinned_page_never_evicted() {
        let (_temp_dir, mut pool) = setup_pool(2);

        let (p0, _) = pool.new_page().unwrap();
        let (p1, _) = pool.new_page().unwrap();
        pool.unpin_page(p1, false);

        // Only p1 is evictable; repeated allocation must spare p0
        let (p2, _) = pool.new_page().unwrap();
        assert!(pool.is_resident(p0));
        assert!(!pool.is_resident(p1));

        pool.unpin_page(p2, false);
        pool.fetch_page(p1).unwrap();
        assert!(pool.is_resident(p0));
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() {
        let (_temp_dir, mut pool) = setup_pool(2);

        let (p0, frame) = pool.new_page().unwrap();
        pool.frame_mut(frame)[0] = 77;
        pool.unpin_page(p0, true);

        // Fill the pool until p0 is evicted
        let (p1, _) = pool.new_page().unwrap();
        pool.unpin_page(p1, false);
        let (p2, _) = pool.new_page().unwrap();
        pool.unpin_page(p2, false);
        assert!(!pool.is_resident(p0));

        let frame = pool.fetch_page(p0).unwrap();
        assert_eq!(pool.frame(frame)[0], 77);
    }

    #[test]
    fn test_flush_page_writes_even_when_clean() {
        let (_temp_dir, mut pool) = setup_pool(4);

        let (p0, frame) = pool.new_page().unwrap();
        pool.frame_mut(frame)[10] = 5;
        pool.unpin_page(p0, true);

        pool.flush_page(p0).unwrap();
        assert_eq!(pool.dirty_page_count(), 0);

        // Flushing again with the flag clear is still a write, not an error
        pool.flush_page(p0).unwrap();

        assert!(matches!(
            pool.flush_page(42),
            Err(FileError::PageNotFound(42))
        ));
    }

    #[test]
    fn test_delete_page() {
        let (_temp_dir, mut pool) = setup_pool(2);

        // Not resident: trivially fine
        assert!(pool.delete_page(9));

        let (p0, _) = pool.new_page().unwrap();
        assert!(!pool.delete_page(p0));

        pool.unpin_page(p0, false);
        assert!(pool.delete_page(p0));
        assert!(!pool.is_resident(p0));

        // The freed frame is reusable
        pool.new_page().unwrap();
        pool.new_page().unwrap();
    }

    #[test]
    fn test_flush_all_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.db");

        let mut page_ids = Vec::new();
        {
            let disk = DiskManager::open(&path).unwrap();
            let mut pool = BufferPool::new(disk, 8);
            for i in 0..5u8 {
                let (page_id, frame) = pool.new_page().unwrap();
                pool.frame_mut(frame)[0] = i;
                pool.unpin_page(page_id, true);
                page_ids.push(page_id);
            }
            pool.flush_all_pages().unwrap();
            assert_eq!(pool.dirty_page_count(), 0);
        }

        let disk = DiskManager::open(&path).unwrap();
        let mut pool = BufferPool::new(disk, 8);
        for (i, &page_id) in page_ids.iter().enumerate() {
            let frame = pool.fetch_page(page_id).unwrap();
            assert_eq!(pool.frame(frame)[0], i as u8);
            pool.unpin_page(page_id, false);
        }
    }

    #[test]
    fn test_drop_flushes_dirty_pages() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.db");

        {
            let disk = DiskManager::open(&path).unwrap();
            let mut pool = BufferPool::new(disk, 4);
            let (page_id, frame) = pool.new_page().unwrap();
            pool.frame_mut(frame)[0] = 88;
            pool.unpin_page(page_id, true);
            // pool is dropped here, flushing the page
        }

        let disk = DiskManager::open(&path).unwrap();
        let mut pool = BufferPool::new(disk, 4);
        let frame = pool.fetch_page(0).unwrap();
        assert_eq!(pool.frame(frame)[0], 88);
    }
}
