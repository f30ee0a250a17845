//! Compile-time geometry of the metadata core.

/// Inode number. Unique within a layer; the same number names the same
/// logical object across a layer chain.
pub type Ino = u64;

/// Size of one disk block in bytes.
pub const BSIZE: usize = 4096;

/// Sentinel disk address: "no block".
pub const INVALID_BLOCK: u64 = u64::MAX;

/// Number of hash buckets in a layer's inode cache. Must be a power of
/// two; bucket selection is `ino & (ICACHE_SIZE - 1)`.
pub const ICACHE_SIZE: usize = 1024;

/// Child block addresses held by one inode-block record. One record is
/// exactly one block: `IBLOCK_MAX` addresses plus the `next` pointer.
pub const IBLOCK_MAX: usize = BSIZE / 8 - 1;

/// Maximum pages staged before a cluster is forced out.
pub const CLUSTER_SIZE: usize = 256;

/// Blocks reserved from the allocator per metadata run. Inode records
/// consume the run sequentially, which is what keeps flush clusters
/// physically contiguous.
pub const INODE_CLUSTER_SIZE: u64 = 32;

/// Inode number of a layer root directory on a fresh filesystem.
pub const ROOT_INO: Ino = 2;

/// Callers may pack a layer index into the upper bits of a file handle;
/// only the low bits name the inode.
pub const HANDLE_MASK: u64 = (1 << 32) - 1;
