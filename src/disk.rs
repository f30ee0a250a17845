//! On-disk metadata format.
//!
//! Field order is the compatibility contract: a serialized inode is the
//! POSIX stat subset followed by the parent inode, the extent pair, the
//! xattr and block-map-directory block addresses, and the flag word. A
//! mode of zero marks a tombstone. Symlink targets are appended
//! immediately after the serialized inode within the same block, with
//! no terminator; their length is `size`.
//!
//! An inode-block record is exactly one block: an array of child block
//! addresses chained through `next`. An address of zero terminates the
//! array within the record; [`INVALID_BLOCK`] marks a reclaimed slot to
//! be skipped.

use core::mem;

use static_assertions::const_assert;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::param::{Ino, BSIZE, IBLOCK_MAX, INVALID_BLOCK};

/// POSIX file-type bits carried in `mode`.
pub mod mode {
    pub const IFMT: u32 = 0o170000;
    pub const IFSOCK: u32 = 0o140000;
    pub const IFLNK: u32 = 0o120000;
    pub const IFREG: u32 = 0o100000;
    pub const IFBLK: u32 = 0o060000;
    pub const IFDIR: u32 = 0o040000;
    pub const IFCHR: u32 = 0o020000;
    pub const IFIFO: u32 = 0o010000;

    pub const fn is_reg(mode: u32) -> bool {
        mode & IFMT == IFREG
    }

    pub const fn is_dir(mode: u32) -> bool {
        mode & IFMT == IFDIR
    }

    pub const fn is_lnk(mode: u32) -> bool {
        mode & IFMT == IFLNK
    }
}

/// Nanosecond-precision timestamp, realtime clock.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, AsBytes, FromBytes)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }
}

/// A contiguous run of disk blocks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Extent {
    pub block: u64,
    pub len: u64,
}

impl Extent {
    pub const fn new(block: u64, len: u64) -> Self {
        Self { block, len }
    }
}

/// Serialized inode. Fixed-size; equal across implementations.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    pub ino: u64,
    /// File type and permission bits. Zero on disk means tombstone.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    /// File size in bytes; symlink target length for symlinks.
    pub size: u64,
    pub blocks: u64,
    pub blksize: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    /// Directory holding this inode; a layer root is its own parent.
    pub parent: u64,
    /// Single-extent representation of a regular file. A zero length
    /// means the file is empty or described by the block map instead.
    pub extent_block: u64,
    pub extent_len: u64,
    pub xattr_block: u64,
    pub bmap_dir_block: u64,
    pub flags: u64,
}

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();
const_assert_eq!(DINODE_SIZE, 152);
const_assert!(DINODE_SIZE <= BSIZE);

impl Dinode {
    /// A fresh in-memory record: secondary block addresses unset, size
    /// and counts zero.
    pub fn empty(ino: Ino, mode: u32) -> Self {
        Self {
            ino,
            mode,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            blksize: BSIZE as u64,
            atime: Timespec::default(),
            mtime: Timespec::default(),
            ctime: Timespec::default(),
            parent: 0,
            extent_block: 0,
            extent_len: 0,
            xattr_block: INVALID_BLOCK,
            bmap_dir_block: INVALID_BLOCK,
            flags: 0,
        }
    }

    /// Parses the serialized inode at the head of a block buffer.
    pub fn parse(buf: &BlockBuf) -> Self {
        let (lv, _) = LayoutVerified::<&[u8], Dinode>::new_from_prefix(buf.bytes())
            .expect("block buffer too small or misaligned for a dinode");
        *lv
    }

    pub fn is_tombstone(&self) -> bool {
        self.mode == 0
    }
}

/// One link of the indirect chain of inode locations.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct InodeBlocks {
    pub blocks: [u64; IBLOCK_MAX],
    pub next: u64,
}

const_assert_eq!(mem::size_of::<InodeBlocks>(), BSIZE);

impl InodeBlocks {
    pub fn empty() -> Box<Self> {
        Box::new(Self {
            blocks: [0; IBLOCK_MAX],
            next: INVALID_BLOCK,
        })
    }
}

/// Block-aligned scratch buffer for reading raw blocks. The alignment
/// lets serialized structures be viewed in place.
#[repr(C, align(4096))]
pub struct BlockBuf {
    bytes: [u8; BSIZE],
}

const_assert_eq!(mem::size_of::<BlockBuf>(), BSIZE);

impl BlockBuf {
    pub fn boxed() -> Box<Self> {
        Box::new(Self { bytes: [0; BSIZE] })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}
