//! Layer context and the global filesystem.
//!
//! A [`Layer`] is one mountable filesystem in a stacked hierarchy. It
//! inherits unmodified metadata from its parent chain and diverges only
//! on mutation; everything resident diverged (or loaded) metadata lives
//! in the layer's inode cache. The [`Gfs`] value is the process-scoped
//! context every operation threads through: superblock counters,
//! statistics, and the handles to the external collaborators.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use spin::{Mutex, MutexGuard, RwLock};

use crate::disk::{mode, Dinode, Timespec};
use crate::flush::FlushState;
use crate::icache::Icache;
use crate::inode::{get_inode, Inode, InodeFlags, Payload};
use crate::io::{BlockAlloc, BlockIo, PageIo, PayloadIo};
use crate::param::{Ino, HANDLE_MASK, INVALID_BLOCK, ROOT_INO};

/// Global superblock counters. Manipulated by atomic increment and
/// decrement only; no lock.
pub struct Superblock {
    /// Inodes created across all layers.
    inodes: AtomicU64,
    /// Highest inode number handed out so far.
    next_inode: AtomicU64,
    /// Distinguished snapshot-root inode number; zero when unset.
    snap_root: AtomicU64,
}

impl Superblock {
    fn new() -> Self {
        Self {
            inodes: AtomicU64::new(0),
            next_inode: AtomicU64::new(ROOT_INO),
            snap_root: AtomicU64::new(0),
        }
    }

    pub fn inode_count(&self) -> u64 {
        self.inodes.load(Ordering::Acquire)
    }

    pub fn snap_root(&self) -> Ino {
        self.snap_root.load(Ordering::Acquire)
    }
}

/// The process-wide filesystem: counters plus the collaborator seams.
pub struct Gfs {
    pub sb: Superblock,
    clones: AtomicU64,
    snap_root_inode: RwLock<Option<Arc<Inode>>>,
    pub dev: Arc<dyn BlockIo>,
    pub alloc: Arc<dyn BlockAlloc>,
    pub pager: Arc<dyn PageIo>,
    pub payload: Arc<dyn PayloadIo>,
}

impl Gfs {
    pub fn new(
        dev: Arc<dyn BlockIo>,
        alloc: Arc<dyn BlockAlloc>,
        pager: Arc<dyn PageIo>,
        payload: Arc<dyn PayloadIo>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sb: Superblock::new(),
            clones: AtomicU64::new(0),
            snap_root_inode: RwLock::new(None),
            dev,
            alloc,
            pager,
            payload,
        })
    }

    /// Inodes cloned for copy-on-write since mount. Advisory.
    pub fn clones(&self) -> u64 {
        self.clones.load(Ordering::Relaxed)
    }

    pub(crate) fn note_clone(&self) {
        self.clones.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_inode(&self) {
        self.sb.inodes.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_inodes(&self, count: u64) {
        self.sb.inodes.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn snap_root_inode(&self) -> Option<Arc<Inode>> {
        self.snap_root_inode.read().clone()
    }
}

/// Identity a resident inode keeps for its owning layer: enough to
/// compare ownership and to consult the freeze flag without walking
/// back to the layer itself.
#[derive(Clone)]
pub struct LayerTag {
    pub(crate) gindex: u32,
    pub(crate) frozen: Arc<AtomicBool>,
}

/// Per-layer superblock fields the core owns.
pub struct LayerSuper {
    /// Head of the indirect chain of inode-block records.
    pub inode_block: AtomicU64,
}

pub struct Layer {
    gfs: Arc<Gfs>,
    /// Index of this layer in the global layer table.
    gindex: u32,
    /// Inode number of this layer's root directory.
    root: Ino,
    parent: Option<Arc<Layer>>,
    /// Set exactly once, when a caller takes exclusive ownership of the
    /// whole layer; per-inode locking is skipped from then on.
    frozen: Arc<AtomicBool>,
    removed: AtomicBool,
    /// Serializes parent-chain walks within this layer.
    ilock: Mutex<()>,
    icache: Icache,
    root_inode: RwLock<Option<Arc<Inode>>>,
    pub sb: LayerSuper,
    /// Resident inode records.
    icount: AtomicU64,
    /// Inode records written by sync, cumulative.
    iwrite: AtomicU64,
    pub(crate) flush: Mutex<FlushState>,
}

impl Layer {
    pub fn new(
        gfs: Arc<Gfs>,
        gindex: u32,
        root: Ino,
        inode_block: u64,
        parent: Option<Arc<Layer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gfs,
            gindex,
            root,
            parent,
            frozen: Arc::new(AtomicBool::new(false)),
            removed: AtomicBool::new(false),
            ilock: Mutex::new(()),
            icache: Icache::new(),
            root_inode: RwLock::new(None),
            sb: LayerSuper {
                inode_block: AtomicU64::new(inode_block),
            },
            icount: AtomicU64::new(0),
            iwrite: AtomicU64::new(0),
            flush: Mutex::new(FlushState::new()),
        })
    }

    pub fn gfs(&self) -> &Gfs {
        &self.gfs
    }

    pub fn gindex(&self) -> u32 {
        self.gindex
    }

    pub fn root(&self) -> Ino {
        self.root
    }

    pub fn parent(&self) -> Option<&Arc<Layer>> {
        self.parent.as_ref()
    }

    pub fn icache(&self) -> &Icache {
        &self.icache
    }

    pub(crate) fn tag(&self) -> LayerTag {
        LayerTag {
            gindex: self.gindex,
            frozen: self.frozen.clone(),
        }
    }

    /// Disables per-inode locking for good. The caller guarantees
    /// exclusive access to the whole layer from this point on.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Marks the layer as being discarded; a sync in progress stops at
    /// the next inode boundary.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn ilock(&self) -> MutexGuard<'_, ()> {
        self.ilock.lock()
    }

    /// Resolves an inode number against this layer's resident records,
    /// trying the distinguished root references before the hash.
    pub fn lookup_inode(&self, ino: Ino) -> Option<Arc<Inode>> {
        if ino == self.root {
            return self.root_inode.read().clone();
        }
        let snap = self.gfs.sb.snap_root();
        if snap != 0 && ino == snap {
            if let Some(ip) = self.gfs.snap_root_inode() {
                return Some(ip);
            }
        }
        self.icache.lookup(ino)
    }

    pub fn root_inode(&self) -> Option<Arc<Inode>> {
        self.root_inode.read().clone()
    }

    pub(crate) fn set_root_inode(&self, inode: Arc<Inode>) {
        *self.root_inode.write() = Some(inode);
    }

    pub(crate) fn clear_root_inode(&self) {
        *self.root_inode.write() = None;
    }

    /// Accounting for a record created in this layer.
    pub(crate) fn note_new_inode(&self) {
        self.gfs.add_inode();
        self.icount.fetch_add(1, Ordering::AcqRel);
    }

    /// Accounting for a record instantiated from disk at mount.
    pub(crate) fn note_loaded_inode(&self) {
        self.icount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_resident(&self, count: u64) {
        self.icount.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn resident(&self) -> u64 {
        self.icount.load(Ordering::Acquire)
    }

    pub(crate) fn add_written(&self, count: u64) {
        self.iwrite.fetch_add(count, Ordering::Relaxed);
    }

    pub fn written(&self) -> u64 {
        self.iwrite.load(Ordering::Relaxed)
    }
}

/// Atomically draws the next unused inode number from the superblock.
pub fn inode_alloc(layer: &Layer) -> Ino {
    layer.gfs.sb.next_inode.fetch_add(1, Ordering::AcqRel) + 1
}

/// Strips handle bits callers may have packed around an inode number.
pub fn ino_from_handle(handle: u64) -> Ino {
    handle & HANDLE_MASK
}

/// Installs the root directory of a fresh layer. Used when a layer is
/// created rather than loaded; the record is marked dirty so the first
/// sync persists it.
pub fn root_init(layer: &Layer, root: Ino) {
    let mut dinode = Dinode::empty(root, mode::IFDIR | 0o755);
    dinode.nlink = 2;
    dinode.parent = root;
    let now = Timespec::now();
    dinode.atime = now;
    dinode.mtime = now;
    dinode.ctime = now;

    let inode = Inode::from_parts(
        dinode,
        INVALID_BLOCK,
        Payload::Directory(None),
        None,
        InodeFlags::DIRTY | InodeFlags::DIR_DIRTY,
    );
    layer.note_new_inode();
    let inode = layer.icache.add(layer, inode);
    layer.set_root_inode(inode);
}

/// Points the global filesystem at its snapshot-root directory, so
/// resolving that number skips the hash in every layer. Switching an
/// established root is supported but noisy.
pub fn set_snapshot_root(base: &Arc<Layer>, ino: Ino) {
    let gfs = base.gfs();
    let prev = gfs.sb.snap_root();
    if prev != 0 {
        warn!("switching snapshot root from {} to {}", prev, ino);
        gfs.sb.snap_root.store(0, Ordering::Release);
    }

    let guard = get_inode(base, ino, None, false, false).expect("snapshot root inode not found");
    assert!(
        mode::is_dir(guard.inner().dinode.mode),
        "snapshot root must be a directory"
    );
    let inode = guard.inode().clone();
    drop(guard);

    *gfs.snap_root_inode.write() = Some(inode);
    gfs.sb.snap_root.store(ino, Ordering::Release);
    info!("snapshot root inode {}", ino);
}
