pub mod file;
pub mod index;

pub use file::{BUFFER_POOL_SIZE, BufferPool, DiskManager, PAGE_SIZE};
pub use index::BPlusTree;
