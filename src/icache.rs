//! Per-layer inode hash cache.
//!
//! A fixed power-of-two array of buckets, keyed by inode number. Each
//! bucket owns the head of a singly linked chain; the chain link lives
//! in the inode itself and is written exactly once, under the bucket
//! mutex, when the record is inserted. Releasing the mutex publishes
//! both the link and the new head, so a lookup only needs the mutex
//! long enough to snapshot the head; the traversal runs over immutable
//! links. Records are never removed from a bucket while the layer is
//! mounted, which is what makes the scheme sound.

use std::sync::Arc;

use array_macro::array;
use log::debug;
use spin::Mutex;

use crate::inode::{Inode, Payload};
use crate::layer::Layer;
use crate::param::{Ino, ICACHE_SIZE};

pub(crate) struct Bucket {
    head: Mutex<Option<Arc<Inode>>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            head: Mutex::new(None),
        }
    }
}

pub struct Icache {
    buckets: Box<[Bucket; ICACHE_SIZE]>,
}

impl Icache {
    pub fn new() -> Self {
        Self {
            buckets: Box::new(array![_ => Bucket::new(); ICACHE_SIZE]),
        }
    }

    fn bucket(&self, ino: Ino) -> &Bucket {
        &self.buckets[ino as usize & (ICACHE_SIZE - 1)]
    }

    /// Inserts a record, binding it to its owning layer. At most one
    /// record per inode number may ever enter a layer's cache; the
    /// lookup/clone paths serialize against each other to keep it so.
    pub fn add(&self, layer: &Layer, inode: Arc<Inode>) -> Arc<Inode> {
        inode.set_owner(layer.tag());
        let bucket = self.bucket(inode.ino());
        let mut head = bucket.head.lock();
        debug_assert!(
            {
                let mut cur = head.clone();
                let mut dup = false;
                while let Some(node) = cur {
                    dup |= node.ino() == inode.ino();
                    cur = node.next_link();
                }
                !dup
            },
            "duplicate inode in bucket"
        );
        inode.set_next(head.clone());
        *head = Some(inode.clone());
        inode
    }

    /// Finds a resident record by number.
    pub fn lookup(&self, ino: Ino) -> Option<Arc<Inode>> {
        let mut cur = self.bucket(ino).head.lock().clone();
        while let Some(node) = cur {
            if node.ino() == ino {
                return Some(node);
            }
            cur = node.next_link();
        }
        None
    }

    /// Snapshots every bucket head, in bucket order.
    pub(crate) fn heads(&self) -> impl Iterator<Item = Option<Arc<Inode>>> + '_ {
        self.buckets.iter().map(|b| b.head.lock().clone())
    }

    fn take_heads(&self) -> impl Iterator<Item = Option<Arc<Inode>>> + '_ {
        self.buckets.iter().map(|b| b.head.lock().take())
    }
}

impl Default for Icache {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains a layer's cache at teardown: releases every variant payload,
/// returns the metadata extents still attached to records, and settles
/// the counters. The caller guarantees exclusive access to the layer;
/// teardown of a live layer follows a freeze, so the per-inode locks
/// degrade to no-ops here.
pub fn destroy_inodes(layer: &Layer, remove_from_superblock: bool) {
    let mut icount: u64 = 0;
    let mut rcount: u64 = 0;

    for head in layer.icache().take_heads() {
        let mut cur = head;
        while let Some(node) = cur {
            if !node.is_removed() {
                rcount += 1;
            }
            drain(layer, &node);
            icount += 1;
            cur = node.next_link();
        }
    }

    layer.clear_root_inode();
    debug!(
        "destroyed {} inodes in layer {} ({} live)",
        icount,
        layer.gindex(),
        rcount
    );
    if remove_from_superblock && icount > 0 {
        layer.gfs().sub_inodes(rcount);
    }
    layer.sub_resident(icount);
}

/// Releases one record's payload and extents.
fn drain(layer: &Layer, inode: &Arc<Inode>) {
    let mut guard = Inode::lock(inode, true);
    let inner = guard.inner_mut();

    if let Payload::Regular { .. } = inner.payload {
        layer.gfs().pager.trunc_pages(layer, inner, 0);
    }
    match core::mem::replace(&mut inner.payload, Payload::Special) {
        Payload::Regular { pages, data } => {
            debug_assert!(pages.is_empty(), "dirty pages survived truncate");
            drop(data);
        }
        Payload::Directory(entries) => drop(entries),
        // A shared target aliases an ancestor; dropping the handle is
        // correct in both the shared and owned cases.
        Payload::Symlink(target) => drop(target),
        Payload::Special => {}
    }
    inner.xattrs = None;

    let bmap_dir = core::mem::take(&mut inner.bmap_dir_extents);
    let xattr = core::mem::take(&mut inner.xattr_extents);
    drop(guard);

    if !bmap_dir.is_empty() {
        layer.gfs().alloc.free_meta(layer, &bmap_dir, false);
    }
    if !xattr.is_empty() {
        layer.gfs().alloc.free_meta(layer, &xattr, false);
    }
}
