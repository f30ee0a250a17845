//! layerfs: inode/metadata core of a layered, copy-on-write userspace
//! filesystem backing stacked container-image layers on a block device.
//!
//! Each layer is an independently mountable filesystem that inherits
//! unmodified metadata from its parent layer and diverges only on
//! mutation. This crate owns the per-layer inode cache and its
//! copy-on-write lifecycle:
//!
//! * loading records from the on-disk indirect chain at mount
//!   ([`read_inodes`]),
//! * resolving numbers across the parent chain and cloning on first
//!   write ([`get_inode`], [`clone_inode`]),
//! * per-inode reader/writer locking with a frozen-layer bypass,
//! * batching dirty records into physically contiguous page clusters
//!   ([`flush_inode`], [`sync_inodes`]),
//! * and draining everything at teardown ([`destroy_inodes`]).
//!
//! The kernel-facing operation multiplexer, the block allocator, the
//! real page cache and the payload storage formats are external
//! collaborators reached through the [`BlockIo`], [`BlockAlloc`],
//! [`PageIo`] and [`PayloadIo`] traits.

mod disk;
mod error;
mod flush;
mod icache;
mod inode;
mod io;
mod layer;
mod load;
mod lock;
pub mod mem;
mod param;

pub use disk::{mode, BlockBuf, Dinode, Extent, InodeBlocks, Timespec, DINODE_SIZE};
pub use error::{Error, Result};
pub use flush::{flush_inode, flush_inode_blocks, invalidate_inode_pages, sync_inodes};
pub use icache::{destroy_inodes, Icache};
pub use inode::{
    clone_inode, get_inode, inode_init, BlockMap, DirEntries, Dirent, FileData, Inode, InodeFlags,
    InodeGuard, InodeInner, Payload, Xattrs,
};
pub use io::{BlockAlloc, BlockIo, NullPayload, Page, PageIo, PayloadIo};
pub use layer::{
    ino_from_handle, inode_alloc, root_init, set_snapshot_root, Gfs, Layer, LayerSuper, Superblock,
};
pub use load::read_inodes;
pub use param::{
    Ino, BSIZE, CLUSTER_SIZE, HANDLE_MASK, IBLOCK_MAX, ICACHE_SIZE, INODE_CLUSTER_SIZE,
    INVALID_BLOCK, ROOT_INO,
};
