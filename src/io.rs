//! Seams to the external collaborators: block device, block allocator,
//! page cache, and the per-type payload modules.
//!
//! The core never touches a device directly; everything below the
//! metadata layer is reached through these traits. Payload methods have
//! no-op defaults because the block-map, directory and xattr storage
//! formats are owned by their modules, not by this crate.

use crate::disk::{BlockBuf, Extent};
use crate::error::Result;
use crate::inode::InodeInner;
use crate::layer::Layer;
use crate::param::BSIZE;

/// A data page staged for writing, tied to one disk block.
pub struct Page {
    pub block: u64,
    pub data: Box<BlockBuf>,
    /// Set when the page carries freshly generated content rather than
    /// data read from the device.
    pub new_data: bool,
}

impl Page {
    pub fn zeroed(block: u64) -> Self {
        Self {
            block,
            data: BlockBuf::boxed(),
            new_data: false,
        }
    }
}

/// Reads and writes of single blocks. `buf` is always exactly one block.
pub trait BlockIo: Send + Sync {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()>;
}

/// Metadata block allocation.
pub trait BlockAlloc: Send + Sync {
    /// Reserves a contiguous run of `count` metadata blocks and returns
    /// the first block. With `exact`, the run must be exactly `count`
    /// blocks long.
    fn alloc_meta(&self, layer: &Layer, count: u64, exact: bool) -> Result<u64>;

    /// Returns metadata extents to the allocator. `update_super` is
    /// false on layer teardown, where the on-disk superblock is not
    /// rewritten.
    fn free_meta(&self, layer: &Layer, extents: &[Extent], update_super: bool);
}

/// The page cache: hands out pages for new data and persists clusters.
pub trait PageIo: Send + Sync {
    fn page_new_data(&self, layer: &Layer, block: u64) -> Page;

    /// Persists a physically contiguous, strictly ascending run of
    /// pages as a single write.
    fn flush_cluster(&self, layer: &Layer, pages: &[Page]) -> Result<()>;

    /// Discards staged pages without writing them.
    fn release(&self, layer: &Layer, pages: Vec<Page>);

    /// Truncates a regular inode's dirty pages at `offset`, releasing
    /// everything at or past it.
    fn trunc_pages(&self, layer: &Layer, inode: &mut InodeInner, offset: u64);
}

/// Secondary reads and flushes for the variant payloads. Readers are
/// handed the raw block the inode was parsed from; flushers update the
/// inode's secondary block addresses and extent lists in place.
pub trait PayloadIo: Send + Sync {
    fn bmap_read(&self, _layer: &Layer, _inode: &mut InodeInner, _buf: &BlockBuf) -> Result<()> {
        Ok(())
    }

    fn dir_read(&self, _layer: &Layer, _inode: &mut InodeInner, _buf: &BlockBuf) -> Result<()> {
        Ok(())
    }

    fn xattr_read(&self, _layer: &Layer, _inode: &mut InodeInner, _buf: &BlockBuf) -> Result<()> {
        Ok(())
    }

    fn bmap_flush(&self, _layer: &Layer, _inode: &mut InodeInner) -> Result<()> {
        Ok(())
    }

    fn dir_flush(&self, _layer: &Layer, _inode: &mut InodeInner) -> Result<()> {
        Ok(())
    }

    fn xattr_flush(&self, _layer: &Layer, _inode: &mut InodeInner) -> Result<()> {
        Ok(())
    }
}

/// Payload backend for layers whose secondary metadata lives nowhere,
/// such as scratch filesystems in tests.
pub struct NullPayload;

impl PayloadIo for NullPayload {}

pub(crate) fn check_block_buf(buf: &[u8]) {
    assert_eq!(buf.len(), BSIZE, "block buffer must be exactly one block");
}
