//! Disk-resident B+ tree
//!
//! The tree owns the buffer pool and works directly on pinned page bytes
//! through the views in [`super::node`]. Its root page id is cached in memory
//! and persisted through the meta page (page 0) whenever it changes, so
//! reopening a database file rebuilds a working index without any rewrite.
//!
//! Deletion is lazy: removing a key zeroes the value bytes in place and keeps
//! the key as a separator anchor. Search and scan skip such tombstones. Tree
//! depth therefore never shrinks over a workload.

use log::debug;

use crate::file::{BufferPool, FrameId, INVALID_PAGE_ID, PageId};

use super::error::{IndexError, IndexResult};
use super::node::{
    self, INTERNAL_MAX_KEYS, InternalNode, LEAF_MAX_ENTRIES, LeafNode, META_PAGE_ID,
    PAGE_TYPE_INTERNAL, PAGE_TYPE_LEAF, VALUE_SIZE,
};

/// B+ tree index over i32 keys and short fixed-width string values
pub struct BPlusTree {
    pool: BufferPool,
    root_page_id: PageId,
}

impl BPlusTree {
    /// Attach to a database, restoring the root from the meta page when the
    /// file already holds pages
    pub fn new(mut pool: BufferPool) -> IndexResult<Self> {
        let mut root_page_id = INVALID_PAGE_ID;

        if pool.num_pages() > 0 {
            let frame = pool.fetch_page(META_PAGE_ID)?;
            root_page_id = node::meta_root(pool.frame(frame));
            pool.unpin_page(META_PAGE_ID, false);
            debug!("restored root page id {root_page_id}");
        }

        Ok(Self { pool, root_page_id })
    }

    /// Whether the tree holds no nodes at all
    pub fn is_empty(&self) -> bool {
        self.root_page_id == INVALID_PAGE_ID
    }

    /// Look up a key, skipping tombstoned entries
    pub fn search(&mut self, key: i32) -> IndexResult<Option<String>> {
        if self.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let frame = self.find_leaf(key)?;
        let page_id = self.pool.frame_page_id(frame);

        let leaf = LeafNode::new(self.pool.frame_mut(frame));
        let slot = leaf.lower_bound(key);
        let mut result = None;
        if slot < leaf.num_keys() && leaf.key_at(slot) == key && leaf.is_live(slot) {
            result = Some(leaf.value_string(slot));
        }

        self.pool.unpin_page(page_id, false);
        Ok(result)
    }

    /// Insert a key, overwriting the value of an existing one
    ///
    /// Values are truncated to `VALUE_SIZE - 1` bytes. A value starting with
    /// a NUL byte is indistinguishable from a tombstone and must not be
    /// stored.
    pub fn insert(&mut self, key: i32, value: &str) -> IndexResult<()> {
        if self.root_page_id == INVALID_PAGE_ID {
            return self.init_root(key, value);
        }

        let frame = self.find_leaf(key)?;
        let page_id = self.pool.frame_page_id(frame);

        let mut leaf = LeafNode::new(self.pool.frame_mut(frame));
        let slot = leaf.lower_bound(key);
        if slot < leaf.num_keys() && leaf.key_at(slot) == key {
            // Keys stay unique: update in place, full leaf or not
            leaf.write_value(slot, value);
        } else if leaf.num_keys() < LEAF_MAX_ENTRIES {
            leaf.insert_entry(key, value);
        } else {
            self.split_leaf(frame, key, value)?;
        }

        self.pool.unpin_page(page_id, true);
        Ok(())
    }

    /// Tombstone a key; false when it is absent or already dead
    pub fn remove(&mut self, key: i32) -> IndexResult<bool> {
        if self.root_page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let frame = self.find_leaf(key)?;
        let page_id = self.pool.frame_page_id(frame);

        let mut leaf = LeafNode::new(self.pool.frame_mut(frame));
        let slot = leaf.lower_bound(key);
        if slot >= leaf.num_keys() || leaf.key_at(slot) != key || !leaf.is_live(slot) {
            self.pool.unpin_page(page_id, false);
            return Ok(false);
        }

        leaf.clear_value(slot);
        self.pool.unpin_page(page_id, true);
        Ok(true)
    }

    /// All live entries with `start_key <= key <= end_key`, in key order
    pub fn scan(&mut self, start_key: i32, end_key: i32) -> IndexResult<Vec<(i32, String)>> {
        let mut results = Vec::new();
        if self.root_page_id == INVALID_PAGE_ID {
            return Ok(results);
        }

        let mut frame = self.find_leaf(start_key)?;
        let mut first = true;

        loop {
            let page_id = self.pool.frame_page_id(frame);
            let leaf = LeafNode::new(self.pool.frame_mut(frame));

            // Binary search positions us inside the first leaf; every later
            // leaf is consumed from slot 0 thanks to the chain ordering
            let start_slot = if first { leaf.lower_bound(start_key) } else { 0 };
            first = false;

            for slot in start_slot..leaf.num_keys() {
                let key = leaf.key_at(slot);
                if key > end_key {
                    self.pool.unpin_page(page_id, false);
                    return Ok(results);
                }
                if key >= start_key && leaf.is_live(slot) {
                    results.push((key, leaf.value_string(slot)));
                }
            }

            let next = leaf.next();
            self.pool.unpin_page(page_id, false);
            if next == INVALID_PAGE_ID {
                break;
            }
            frame = self.pool.fetch_page(next)?;
            match node::validate(next, self.pool.frame(frame)) {
                Ok(PAGE_TYPE_LEAF) => {}
                Ok(_) => {
                    self.pool.unpin_page(next, false);
                    return Err(IndexError::CorruptedNode(next));
                }
                Err(e) => {
                    self.pool.unpin_page(next, false);
                    return Err(e);
                }
            }
        }

        Ok(results)
    }

    /// Descend to the leaf that owns `key`; the returned frame stays pinned
    fn find_leaf(&mut self, key: i32) -> IndexResult<FrameId> {
        let mut page_id = self.root_page_id;
        let mut frame = self.pool.fetch_page(page_id)?;

        loop {
            let tag = match node::validate(page_id, self.pool.frame(frame)) {
                Ok(tag) => tag,
                Err(e) => {
                    self.pool.unpin_page(page_id, false);
                    return Err(e);
                }
            };
            if tag == PAGE_TYPE_LEAF {
                return Ok(frame);
            }

            let child = InternalNode::new(self.pool.frame_mut(frame)).child_for(key);
            self.pool.unpin_page(page_id, false);
            page_id = child;
            frame = self.pool.fetch_page(page_id)?;
        }
    }

    /// First insert on a fresh database: the meta page (page 0) and the root
    /// leaf (page 1) are allocated in that order
    fn init_root(&mut self, key: i32, value: &str) -> IndexResult<()> {
        let (meta_id, _) = self.pool.new_page()?;
        debug_assert_eq!(meta_id, META_PAGE_ID);
        // Dirty so the zeroed meta page reaches disk
        self.pool.unpin_page(meta_id, true);

        let (root_id, root_frame) = self.pool.new_page()?;
        let mut leaf = LeafNode::init(self.pool.frame_mut(root_frame));
        leaf.insert_entry(key, value);

        self.root_page_id = root_id;
        debug!("created root leaf at page {root_id}");
        self.update_meta_page()?;
        self.pool.unpin_page(root_id, true);
        Ok(())
    }

    /// Write the cached root id through to the meta page
    fn update_meta_page(&mut self) -> IndexResult<()> {
        let frame = self.pool.fetch_page(META_PAGE_ID)?;
        node::set_meta_root(self.pool.frame_mut(frame), self.root_page_id);
        self.pool.unpin_page(META_PAGE_ID, true);
        Ok(())
    }

    /// Split a full leaf while inserting `(key, value)`
    ///
    /// The separator handed to the parent is the first key of the new right
    /// leaf; being a B+ tree, the key itself stays in the leaf (copy-up).
    /// The caller keeps the old leaf pinned; the new sibling stays pinned
    /// until the parent has been updated.
    fn split_leaf(&mut self, frame: FrameId, key: i32, value: &str) -> IndexResult<()> {
        let mut temp: Vec<(i32, [u8; VALUE_SIZE])>;
        let (old_parent, old_next);
        {
            let leaf = LeafNode::new(self.pool.frame_mut(frame));
            let n = leaf.num_keys();
            let slot = leaf.lower_bound(key);

            temp = Vec::with_capacity(n + 1);
            for i in 0..slot {
                temp.push(leaf.entry_at(i));
            }
            temp.push((key, node::encode_value(value)));
            for i in slot..n {
                temp.push(leaf.entry_at(i));
            }

            old_parent = leaf.parent();
            old_next = leaf.next();
        }

        let total = temp.len();
        let split = total / 2;
        let separator = temp[split].0;

        let (new_id, new_frame) = self.pool.new_page()?;
        debug!(
            "split leaf {} at key {separator}, new leaf {new_id}",
            self.pool.frame_page_id(frame)
        );

        {
            let mut left = LeafNode::new(self.pool.frame_mut(frame));
            for (i, (k, v)) in temp[..split].iter().enumerate() {
                left.set_entry(i, *k, v);
            }
            left.set_num_keys(split);
            left.set_next(new_id);
        }
        {
            let mut right = LeafNode::init(self.pool.frame_mut(new_frame));
            for (i, (k, v)) in temp[split..].iter().enumerate() {
                right.set_entry(i, *k, v);
            }
            right.set_num_keys(total - split);
            right.set_parent(old_parent);
            right.set_next(old_next);
        }

        self.insert_into_parent(frame, separator, new_frame)?;
        self.pool.unpin_page(new_id, true);
        Ok(())
    }

    /// Split a full internal node while inserting `(key, right_child)`
    ///
    /// The middle key moves up to the parent and appears in neither half
    /// (move-up). Children shifted to the new node get their parent pointers
    /// rewritten under a transient pin each.
    fn split_internal(&mut self, frame: FrameId, key: i32, right_child: PageId) -> IndexResult<()> {
        let mut temp_keys: Vec<i32>;
        let mut temp_children: Vec<PageId>;
        let old_parent;
        {
            let internal = InternalNode::new(self.pool.frame_mut(frame));
            let n = internal.num_keys();

            let mut idx = 0;
            while idx < n && internal.key_at(idx) < key {
                idx += 1;
            }

            temp_keys = Vec::with_capacity(n + 1);
            for i in 0..n {
                temp_keys.push(internal.key_at(i));
            }
            temp_keys.insert(idx, key);

            temp_children = Vec::with_capacity(n + 2);
            for i in 0..=n {
                temp_children.push(internal.child_at(i));
            }
            temp_children.insert(idx + 1, right_child);

            old_parent = internal.parent();
        }

        let total_keys = temp_keys.len();
        let split = total_keys / 2;
        let middle_key = temp_keys[split];

        let (new_id, new_frame) = self.pool.new_page()?;
        debug!(
            "split internal {} at key {middle_key}, new node {new_id}",
            self.pool.frame_page_id(frame)
        );

        {
            let mut left = InternalNode::new(self.pool.frame_mut(frame));
            for (i, &k) in temp_keys[..split].iter().enumerate() {
                left.set_key_at(i, k);
            }
            for (i, &c) in temp_children[..=split].iter().enumerate() {
                left.set_child_at(i, c);
            }
            left.set_num_keys(split);
        }
        {
            let mut right = InternalNode::init(self.pool.frame_mut(new_frame));
            for (i, &k) in temp_keys[split + 1..].iter().enumerate() {
                right.set_key_at(i, k);
            }
            for (i, &c) in temp_children[split + 1..].iter().enumerate() {
                right.set_child_at(i, c);
            }
            right.set_num_keys(total_keys - split - 1);
            right.set_parent(old_parent);
        }

        for &child_id in &temp_children[split + 1..] {
            let child_frame = self.pool.fetch_page(child_id)?;
            node::set_node_parent(self.pool.frame_mut(child_frame), new_id);
            self.pool.unpin_page(child_id, true);
        }

        self.insert_into_parent(frame, middle_key, new_frame)?;
        self.pool.unpin_page(new_id, true);
        Ok(())
    }

    /// Register a freshly split-off `right` sibling under the parent of
    /// `left`, creating a new root when `left` was the root
    ///
    /// Both halves are pinned by the caller; the parent is pinned only for
    /// the duration of this call.
    fn insert_into_parent(&mut self, left: FrameId, key: i32, right: FrameId) -> IndexResult<()> {
        let parent_id = node::node_parent(self.pool.frame(left));
        if parent_id == INVALID_PAGE_ID {
            return self.create_new_root(left, key, right);
        }

        let right_id = self.pool.frame_page_id(right);
        let parent_frame = self.pool.fetch_page(parent_id)?;
        match node::validate(parent_id, self.pool.frame(parent_frame)) {
            Ok(PAGE_TYPE_INTERNAL) => {}
            Ok(_) => {
                self.pool.unpin_page(parent_id, false);
                return Err(IndexError::CorruptedNode(parent_id));
            }
            Err(e) => {
                self.pool.unpin_page(parent_id, false);
                return Err(e);
            }
        }

        node::set_node_parent(self.pool.frame_mut(right), parent_id);

        let parent_full =
            InternalNode::new(self.pool.frame_mut(parent_frame)).num_keys() >= INTERNAL_MAX_KEYS;
        if !parent_full {
            InternalNode::new(self.pool.frame_mut(parent_frame)).insert_separator(key, right_id);
        } else {
            self.split_internal(parent_frame, key, right_id)?;
        }

        self.pool.unpin_page(parent_id, true);
        Ok(())
    }

    /// Replace the root with a new internal node over `[left, right]`
    fn create_new_root(&mut self, left: FrameId, key: i32, right: FrameId) -> IndexResult<()> {
        let left_id = self.pool.frame_page_id(left);
        let right_id = self.pool.frame_page_id(right);

        let (root_id, root_frame) = self.pool.new_page()?;
        {
            let mut root = InternalNode::init(self.pool.frame_mut(root_frame));
            root.set_num_keys(1);
            root.set_key_at(0, key);
            root.set_child_at(0, left_id);
            root.set_child_at(1, right_id);
        }
        node::set_node_parent(self.pool.frame_mut(left), root_id);
        node::set_node_parent(self.pool.frame_mut(right), root_id);

        self.root_page_id = root_id;
        debug!("new root at page {root_id}");
        self.update_meta_page()?;
        self.pool.unpin_page(root_id, true);
        Ok(())
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        // Best-effort: the pool's own drop still writes back everything dirty
        if self.pool.num_pages() > 0 {
            let _ = self.pool.flush_page(META_PAGE_ID);
        }
    }
}
