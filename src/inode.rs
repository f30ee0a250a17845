//! Inodes.
//!
//! An inode is one resident filesystem object inside one layer. The
//! record owns a mirror of its serialized form, the variant payload for
//! its type (file extents or block map, directory entries, symlink
//! target), and the dirty state that drives the flusher.
//!
//! Layers are copy-on-write: a lookup that misses locally walks the
//! ancestor chain, and a lookup that intends to write clones the
//! ancestor's record into the current layer. The clone aliases the
//! ancestor's payload through a shared handle until the first mutation;
//! the `SHARED` flag is the contract with the write paths, and
//! [`InodeGuard::unshare`] is the mutator that detaches the payload.
//!
//! Locking: each inode carries a reader/writer lock. When the owning
//! layer is frozen the lock is bypassed entirely; the caller of a
//! freeze guarantees exclusive access to the whole layer. Guards record
//! the mode they were acquired in, so a release always matches its
//! acquisition. Flag bits live outside the lock in an atomic word, so
//! the parent walk may observe `REMOVED` without locking the record.
//!
//! Lifecycle: records are created by the loader at mount, by
//! [`inode_init`] for new objects, by [`clone_inode`] on first
//! copy-on-write touch, or by `layer::root_init`. They are never evicted
//! while the layer is mounted and are destroyed only at teardown.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use spin::Once;

use crate::disk::{mode, Dinode, Extent, Timespec};
use crate::io::Page;
use crate::layer::{ino_from_handle, inode_alloc, Layer, LayerTag};
use crate::lock::Lock;
use crate::param::{Ino, INVALID_BLOCK};

bitflags! {
    /// Independent state bits, readable without the inode lock.
    pub struct InodeFlags: u8 {
        /// The record itself must be written.
        const DIRTY = 0x01;
        /// The block map must be flushed before the record.
        const BMAP_DIRTY = 0x02;
        /// The directory payload must be flushed before the record.
        const DIR_DIRTY = 0x04;
        /// The xattr payload must be flushed before the record.
        const XATTR_DIRTY = 0x08;
        /// Logically deleted; flushed as a tombstone if it ever hit disk.
        const REMOVED = 0x10;
        /// The variant payload aliases an ancestor layer's payload and
        /// must not be mutated in place.
        const SHARED = 0x20;
        /// Never shares; set on regular files born in this layer.
        const PRIVATE = 0x40;
    }
}

impl InodeFlags {
    /// All bits that make an inode eligible for flushing.
    pub fn dirty_any() -> InodeFlags {
        InodeFlags::DIRTY | InodeFlags::BMAP_DIRTY | InodeFlags::DIR_DIRTY | InodeFlags::XATTR_DIRTY
    }
}

struct AtomicFlags(AtomicU8);

impl AtomicFlags {
    fn new(flags: InodeFlags) -> Self {
        Self(AtomicU8::new(flags.bits()))
    }

    fn load(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    fn set(&self, flags: InodeFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear(&self, flags: InodeFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// Sparse mapping from file-offset blocks to device blocks; zero marks
/// a hole. Used once a regular file can no longer be described by a
/// single extent.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct BlockMap {
    slots: Vec<u64>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The map equivalent of a contiguous extent; sparse writes start
    /// from here.
    pub fn from_extent(extent: Extent) -> Self {
        Self {
            slots: (0..extent.len).map(|i| extent.block + i).collect(),
        }
    }

    pub fn get(&self, bn: u64) -> u64 {
        self.slots.get(bn as usize).copied().unwrap_or(0)
    }

    pub fn set(&mut self, bn: u64, block: u64) {
        let bn = bn as usize;
        if bn >= self.slots.len() {
            self.slots.resize(bn + 1, 0);
        }
        self.slots[bn] = block;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Directory payload. The entry storage format belongs to the directory
/// module; the core only creates, aliases and drops it.
#[derive(Clone, Default, Debug)]
pub struct DirEntries {
    pub entries: Vec<Dirent>,
}

#[derive(Clone, Debug)]
pub struct Dirent {
    pub ino: Ino,
    pub name: Box<[u8]>,
}

/// Extended attributes, opaque to the core.
#[derive(Clone, Default, Debug)]
pub struct Xattrs {
    pub entries: Vec<(Box<[u8]>, Box<[u8]>)>,
}

/// Content representation of a regular file. A file is described by a
/// single extent or by a block map, never both.
pub enum FileData {
    Empty,
    Extent(Extent),
    Mapped(Arc<BlockMap>),
}

/// Variant payload, determined by the type bits of `mode`.
pub enum Payload {
    Regular { data: FileData, pages: Vec<Page> },
    Directory(Option<Arc<DirEntries>>),
    Symlink(Option<Arc<[u8]>>),
    /// Devices, fifos and sockets carry no payload.
    Special,
}

impl Payload {
    pub fn for_mode(mode: u32) -> Self {
        if mode::is_reg(mode) {
            Payload::Regular {
                data: FileData::Empty,
                pages: Vec::new(),
            }
        } else if mode::is_dir(mode) {
            Payload::Directory(None)
        } else if mode::is_lnk(mode) {
            Payload::Symlink(None)
        } else {
            Payload::Special
        }
    }
}

/// Everything guarded by the inode lock.
pub struct InodeInner {
    /// Mirror of the serialized record.
    pub dinode: Dinode,

    /// Disk block holding this inode's serialized record, or
    /// [`INVALID_BLOCK`] until the first flush.
    pub block: u64,

    pub payload: Payload,

    pub xattrs: Option<Arc<Xattrs>>,

    /// Metadata extents holding the flushed xattr and block-map
    /// directory blocks; reclaimed on removal and at teardown.
    pub xattr_extents: Vec<Extent>,
    pub bmap_dir_extents: Vec<Extent>,
}

impl InodeInner {
    pub fn symlink_target(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Symlink(Some(target)) => Some(target),
            _ => None,
        }
    }
}

/// In-memory inode record.
pub struct Inode {
    ino: Ino,
    flags: AtomicFlags,
    /// Owning layer; written once when the record enters the cache.
    owner: Once<LayerTag>,
    /// Bucket chain link; written once when the record enters the cache.
    next: Once<Option<Arc<Inode>>>,
    inner: Lock<InodeInner>,
}

impl Inode {
    pub(crate) fn from_parts(
        dinode: Dinode,
        block: u64,
        payload: Payload,
        xattrs: Option<Arc<Xattrs>>,
        flags: InodeFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino: dinode.ino,
            flags: AtomicFlags::new(flags),
            owner: Once::new(),
            next: Once::new(),
            inner: Lock::new(InodeInner {
                dinode,
                block,
                payload,
                xattrs,
                xattr_extents: Vec::new(),
                bmap_dir_extents: Vec::new(),
            }),
        })
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn flags(&self) -> InodeFlags {
        self.flags.load()
    }

    /// Raises the given flag bits; the flusher lowers them.
    pub fn mark_dirty(&self, flags: InodeFlags) {
        self.flags.set(flags);
    }

    pub(crate) fn clear_flags(&self, flags: InodeFlags) {
        self.flags.clear(flags);
    }

    pub fn is_dirty_any(&self) -> bool {
        self.flags.load().intersects(InodeFlags::dirty_any())
    }

    pub fn is_removed(&self) -> bool {
        self.flags.load().contains(InodeFlags::REMOVED)
    }

    pub fn owned_by(&self, layer: &Layer) -> bool {
        self.owner.get().map_or(false, |t| t.gindex == layer.gindex())
    }

    fn frozen(&self) -> bool {
        self.owner
            .get()
            .map_or(false, |t| t.frozen.load(Ordering::Acquire))
    }

    pub(crate) fn set_owner(&self, tag: LayerTag) {
        let _ = self.owner.call_once(|| tag);
    }

    pub(crate) fn set_next(&self, link: Option<Arc<Inode>>) {
        let _ = self.next.call_once(|| link);
    }

    pub(crate) fn next_link(&self) -> Option<Arc<Inode>> {
        self.next.get().cloned().flatten()
    }

    /// Takes the inode lock in the requested mode and returns the
    /// guard. On a frozen layer nothing is acquired; the caller of the
    /// freeze guarantees exclusive access to the whole layer.
    pub fn lock(this: &Arc<Inode>, exclusive: bool) -> InodeGuard {
        let mode = if this.frozen() {
            LockMode::Frozen
        } else {
            this.inner.acquire(exclusive);
            if exclusive {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            }
        };
        InodeGuard {
            inode: this.clone(),
            mode,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
    Frozen,
}

/// Owning lock guard. Releases on drop in the mode it acquired, which
/// keeps a freeze that happens while the guard is live from unbalancing
/// the lock.
pub struct InodeGuard {
    inode: Arc<Inode>,
    mode: LockMode,
}

impl InodeGuard {
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn inner(&self) -> &InodeInner {
        // SAFETY: the guard holds the lock in some mode, or the layer is
        // frozen and the caller has exclusive access to it.
        unsafe { self.inode.inner.get() }
    }

    pub fn inner_mut(&mut self) -> &mut InodeInner {
        assert!(
            self.mode != LockMode::Shared,
            "mutating an inode through a shared lock"
        );
        // SAFETY: the lock is held exclusively, or the layer is frozen
        // and the caller has exclusive access to it.
        unsafe { self.inode.inner.get_mut() }
    }

    /// Sets the requested subset of timestamps from the realtime clock.
    pub fn update_times(&mut self, atime: bool, mtime: bool, ctime: bool) {
        let now = Timespec::now();
        let dinode = &mut self.inner_mut().dinode;
        if atime {
            dinode.atime = now;
        }
        if mtime {
            dinode.mtime = now;
        }
        if ctime {
            dinode.ctime = now;
        }
    }

    /// Materializes a private copy of an aliased payload. Write paths
    /// must call this before the first mutation of a shared inode.
    pub fn unshare(&mut self) {
        if !self.inode.flags().contains(InodeFlags::SHARED) {
            return;
        }
        match &mut self.inner_mut().payload {
            Payload::Regular {
                data: FileData::Mapped(map),
                ..
            } => {
                Arc::make_mut(map);
            }
            Payload::Directory(Some(entries)) => {
                Arc::make_mut(entries);
            }
            Payload::Symlink(Some(target)) => {
                let fresh: Arc<[u8]> = Arc::from(&target[..]);
                *target = fresh;
            }
            _ => {}
        }
        self.inode.clear_flags(InodeFlags::SHARED);
    }
}

impl core::ops::Deref for InodeGuard {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

impl Drop for InodeGuard {
    fn drop(&mut self) {
        match self.mode {
            // SAFETY: the guard acquired the lock in this mode.
            LockMode::Shared => unsafe { self.inode.inner.release(false) },
            LockMode::Exclusive => unsafe { self.inode.inner.release(true) },
            LockMode::Frozen => {}
        }
    }
}

/// Resolves an inode number within a layer and returns it locked in the
/// requested mode.
///
/// A non-null `hint` that still belongs to this layer (or is wanted
/// read-only) short-circuits the cache. A local miss walks the ancestor
/// chain; with `copy` the ancestor's record is cloned into this layer,
/// without it the ancestor's record itself is returned for read-only
/// access across layers. `None` means the object does not exist here,
/// or exists only as an ancestor tombstone.
pub fn get_inode(
    layer: &Layer,
    ino: u64,
    hint: Option<&Arc<Inode>>,
    copy: bool,
    exclusive: bool,
) -> Option<InodeGuard> {
    assert!(!layer.is_removed());
    let inum = ino_from_handle(ino);

    if let Some(hint) = hint {
        if !copy || hint.owned_by(layer) {
            assert_eq!(hint.ino(), inum, "handle does not match its inode");
            return Some(Inode::lock(hint, exclusive));
        }
    }

    if let Some(ip) = layer.lookup_inode(inum) {
        return Some(Inode::lock(&ip, exclusive));
    }

    let found = if layer.parent().is_some() {
        get_inode_parent(layer, inum, copy)
    } else {
        None
    };
    match found {
        Some(ip) => Some(Inode::lock(&ip, exclusive)),
        None => {
            debug!(
                "inode {} absent in layer {} root {}",
                inum,
                layer.gindex(),
                layer.root()
            );
            None
        }
    }
}

/// Resolves a local miss through the ancestor chain. `ilock` serializes
/// walks within one layer, so two racing lookups of the same absent
/// inode produce the same record.
fn get_inode_parent(layer: &Layer, inum: Ino, copy: bool) -> Option<Arc<Inode>> {
    let _walk = layer.ilock();

    // The race this re-check closes: another walk may have inserted the
    // inode while this thread waited for ilock.
    if let Some(ip) = layer.icache().lookup(inum) {
        return Some(ip);
    }

    let mut ancestor = layer.parent();
    while let Some(pfs) = ancestor {
        if let Some(parent) = pfs.icache().lookup(inum) {
            // A tombstone in the nearest holder shadows anything above.
            if parent.is_removed() {
                return None;
            }
            return Some(if copy {
                clone_inode(layer, pfs, &parent)
            } else {
                parent
            });
        }
        ancestor = pfs.parent();
    }
    None
}

/// Clones an ancestor inode into `layer` for copy-on-write. The clone
/// carries the full stat block and aliases the ancestor's payload until
/// the first mutation.
pub fn clone_inode(layer: &Layer, origin: &Layer, parent: &Arc<Inode>) -> Arc<Inode> {
    let src = Inode::lock(parent, false);
    let pinner = src.inner();
    let mut dinode = pinner.dinode;
    let mut flags = InodeFlags::DIRTY;

    let payload = match &pinner.payload {
        Payload::Regular { data, pages } => {
            debug_assert!(pages.is_empty(), "cloning a file with dirty pages");
            let data = if pinner.dinode.blocks == 0 {
                // Nothing on disk to share; the child diverges on its own.
                flags |= InodeFlags::PRIVATE;
                FileData::Empty
            } else {
                match data {
                    // An extent is safe to reference without the shared
                    // flag: writes reallocate instead of mutating it.
                    FileData::Extent(extent) => FileData::Extent(*extent),
                    FileData::Mapped(map) => {
                        flags |= InodeFlags::SHARED | InodeFlags::BMAP_DIRTY;
                        FileData::Mapped(map.clone())
                    }
                    FileData::Empty => FileData::Empty,
                }
            };
            Payload::Regular {
                data,
                pages: Vec::new(),
            }
        }
        Payload::Directory(entries) => match entries {
            Some(entries) => {
                flags |= InodeFlags::SHARED | InodeFlags::DIR_DIRTY;
                Payload::Directory(Some(entries.clone()))
            }
            None => Payload::Directory(None),
        },
        Payload::Symlink(target) => {
            flags |= InodeFlags::SHARED;
            Payload::Symlink(target.clone())
        }
        Payload::Special => Payload::Special,
    };

    // A child of the ancestor's root becomes a child of this layer's root.
    if pinner.dinode.parent == origin.root() {
        dinode.parent = layer.root();
    }
    let xattrs = pinner.xattrs.clone();
    drop(src);

    let inode = Inode::from_parts(dinode, INVALID_BLOCK, payload, xattrs, flags);
    layer.note_new_inode();
    let inode = layer.icache().add(layer, inode);
    layer.gfs().note_clone();
    inode
}

/// Initializes a newly created object: allocates a number from the
/// superblock counter, builds the default stat block, inserts the record
/// into the cache and returns it write-locked.
pub fn inode_init(
    layer: &Layer,
    mode_bits: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    parent: u64,
    target: Option<&[u8]>,
) -> InodeGuard {
    let ino = inode_alloc(layer);
    let mut dinode = Dinode::empty(ino, mode_bits);
    dinode.nlink = if mode::is_dir(mode_bits) { 2 } else { 1 };
    dinode.uid = uid;
    dinode.gid = gid;
    dinode.rdev = rdev;
    dinode.parent = ino_from_handle(parent);
    let now = Timespec::now();
    dinode.atime = now;
    dinode.mtime = now;
    dinode.ctime = now;

    let mut flags = InodeFlags::empty();
    if mode::is_reg(mode_bits) {
        flags |= InodeFlags::PRIVATE;
    }
    let payload = match target {
        Some(target) => {
            dinode.size = target.len() as u64;
            Payload::Symlink(Some(Arc::from(target)))
        }
        None => Payload::for_mode(mode_bits),
    };

    let inode = Inode::from_parts(dinode, INVALID_BLOCK, payload, None, flags);
    layer.note_new_inode();
    let inode = layer.icache().add(layer, inode);
    Inode::lock(&inode, true)
}
