//! Dirty-inode flusher.
//!
//! Dirty inodes are serialized onto blocks drawn from reserved
//! contiguous runs, and the resulting pages are coalesced into clusters
//! before they reach the page layer. Because runs are handed out
//! contiguously and consumed sequentially, clusters naturally grow into
//! maximal physically contiguous writes; any gap forces the staged
//! pages out early and starts a new cluster.
//!
//! The locations of flushed records are threaded through an indirect
//! chain of inode-block records; the chain is rewritten at the end of
//! every sync. Durability is promised at whole-sync granularity only.

use arrayvec::ArrayVec;
use itertools::Itertools;
use log::{debug, info};
use zerocopy::AsBytes;

use crate::disk::{mode, InodeBlocks, DINODE_SIZE};
use crate::error::Result;
use crate::inode::{Inode, InodeFlags, InodeGuard, Payload};
use crate::layer::Layer;
use crate::param::{CLUSTER_SIZE, IBLOCK_MAX, INODE_CLUSTER_SIZE, INVALID_BLOCK};

/// Mutable flush-side state of one layer: the open inode-block record,
/// the reserved run of inode blocks, and the page staging list.
pub(crate) struct FlushState {
    /// Current inode-block record and the disk block it will occupy.
    rec: Option<(u64, Box<InodeBlocks>)>,
    /// Next free slot in `rec`.
    index: usize,
    /// Filled records awaiting the chain commit.
    filled: Vec<(u64, Box<InodeBlocks>)>,
    /// Reserved run of blocks for inode records.
    run_next: u64,
    run_left: u64,
    /// Pages staged for the next cluster write, ascending by block.
    staging: ArrayVec<crate::io::Page, CLUSTER_SIZE>,
}

impl FlushState {
    pub(crate) fn new() -> Self {
        Self {
            rec: None,
            index: 0,
            filled: Vec::new(),
            run_next: 0,
            run_left: 0,
            staging: ArrayVec::new(),
        }
    }
}

/// Opens a fresh inode-block record and links it at the head of the
/// layer's indirect chain.
fn new_inode_block(layer: &Layer, state: &mut FlushState) -> Result<()> {
    let block = layer.gfs().alloc.alloc_meta(layer, 1, true)?;
    let mut rec = InodeBlocks::empty();
    rec.next = layer
        .sb
        .inode_block
        .swap(block, std::sync::atomic::Ordering::AcqRel);
    if let Some(old) = state.rec.take() {
        state.filled.push(old);
    }
    state.rec = Some((block, rec));
    state.index = 0;
    Ok(())
}

/// Writes the staged pages out as one physically contiguous cluster.
fn flush_staging(layer: &Layer, state: &mut FlushState) -> Result<()> {
    if state.staging.is_empty() {
        return Ok(());
    }
    let pages = core::mem::take(&mut state.staging);
    debug_assert!(
        pages.iter().tuple_windows().all(|(a, b)| b.block == a.block + 1),
        "staged cluster is not contiguous"
    );
    debug!(
        "flushing {} inode pages at block {}",
        pages.len(),
        pages[0].block
    );
    layer.gfs().pager.flush_cluster(layer, &pages)
}

/// Flushes one dirty inode. The caller holds the inode exclusively.
/// Returns whether a record write was scheduled.
pub fn flush_inode(layer: &Layer, ip: &mut InodeGuard) -> Result<bool> {
    let gfs = layer.gfs();

    // Variant payloads flush before the record that points at them.
    if ip.flags().contains(InodeFlags::XATTR_DIRTY) {
        gfs.payload.xattr_flush(layer, ip.inner_mut())?;
        ip.inode().clear_flags(InodeFlags::XATTR_DIRTY);
    }
    if ip.flags().contains(InodeFlags::BMAP_DIRTY) {
        gfs.payload.bmap_flush(layer, ip.inner_mut())?;
        ip.inode().clear_flags(InodeFlags::BMAP_DIRTY);
    }
    if ip.flags().contains(InodeFlags::DIR_DIRTY) {
        gfs.payload.dir_flush(layer, ip.inner_mut())?;
        ip.inode().clear_flags(InodeFlags::DIR_DIRTY);
    }

    if !ip.flags().contains(InodeFlags::DIRTY) {
        return Ok(false);
    }

    let removed = ip.flags().contains(InodeFlags::REMOVED);
    if removed {
        // A tombstone keeps no metadata; reclaim it immediately.
        let inner = ip.inner_mut();
        debug_assert!(
            !matches!(
                inner.payload,
                Payload::Regular {
                    data: crate::inode::FileData::Extent(_),
                    ..
                }
            ),
            "removed inode still holds an extent"
        );
        let bmap_dir = core::mem::take(&mut inner.bmap_dir_extents);
        if !bmap_dir.is_empty() {
            gfs.alloc.free_meta(layer, &bmap_dir, true);
        }
        inner.dinode.bmap_dir_block = INVALID_BLOCK;
        let xattr = core::mem::take(&mut inner.xattr_extents);
        if !xattr.is_empty() {
            gfs.alloc.free_meta(layer, &xattr, true);
        }
        inner.dinode.xattr_block = INVALID_BLOCK;

        if inner.block == INVALID_BLOCK {
            // Never reached disk; the removal is already complete.
            ip.inode().clear_flags(InodeFlags::DIRTY);
            return Ok(false);
        }
    }

    let mut state = layer.flush.lock();

    if ip.inner().block == INVALID_BLOCK {
        if state.rec.is_none() || state.index >= IBLOCK_MAX {
            new_inode_block(layer, &mut state)?;
        }
        if state.run_left == 0 {
            state.run_next = gfs.alloc.alloc_meta(layer, INODE_CLUSTER_SIZE, true)?;
            state.run_left = INODE_CLUSTER_SIZE;
        }
        let block = state.run_next;
        state.run_next += 1;
        state.run_left -= 1;
        ip.inner_mut().block = block;
        let index = state.index;
        let (_, rec) = state.rec.as_mut().expect("open inode-block record");
        rec.blocks[index] = block;
        state.index += 1;
    }

    let inner = ip.inner();
    let mut page = gfs.pager.page_new_data(layer, inner.block);
    let mut dinode = inner.dinode;
    if removed {
        // Remount must see the deletion.
        dinode.mode = 0;
    }
    page.data.bytes_mut()[..DINODE_SIZE].copy_from_slice(dinode.as_bytes());
    if !removed && mode::is_lnk(inner.dinode.mode) {
        let target = inner.symlink_target().unwrap_or(&[]);
        page.data.bytes_mut()[DINODE_SIZE..DINODE_SIZE + target.len()].copy_from_slice(target);
    }
    page.new_data = true;

    let gap = state
        .staging
        .last()
        .map_or(false, |tail| page.block != tail.block + 1);
    if gap {
        flush_staging(layer, &mut state)?;
    }
    state.staging.push(page);
    if state.staging.len() >= CLUSTER_SIZE {
        flush_staging(layer, &mut state)?;
    }
    drop(state);

    ip.inode().clear_flags(InodeFlags::DIRTY);
    Ok(true)
}

/// Walks every bucket and flushes each dirty resident inode, then the
/// residual cluster, then the indirect chain. A layer marked removed
/// mid-sync stops the walk without further writes.
pub fn sync_inodes(layer: &Layer) -> Result<()> {
    info!(
        "syncing inodes for layer {} root {}",
        layer.gindex(),
        layer.root()
    );
    // Staged pages must not survive a failed sync.
    let cleanup = scopeguard::guard((), |()| invalidate_inode_pages(layer));

    let mut count: u64 = 0;
    'walk: for head in layer.icache().heads() {
        let mut cur = head;
        while let Some(ip) = cur {
            if layer.is_removed() {
                break 'walk;
            }
            if ip.is_dirty_any() {
                let mut guard = Inode::lock(&ip, true);
                if flush_inode(layer, &mut guard)? {
                    count += 1;
                }
            }
            cur = ip.next_link();
        }
    }

    if !layer.is_removed() {
        let mut state = layer.flush.lock();
        flush_staging(layer, &mut state)?;
        drop(state);
        flush_inode_blocks(layer)?;
    }
    if count > 0 {
        layer.add_written(count);
    }
    let () = scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}

/// Commits the indirect chain: every filled record plus the open one.
pub fn flush_inode_blocks(layer: &Layer) -> Result<()> {
    let gfs = layer.gfs();
    let mut state = layer.flush.lock();
    for (block, rec) in state.filled.drain(..) {
        gfs.dev.write_block(block, rec.as_bytes())?;
    }
    if let Some((block, rec)) = &state.rec {
        gfs.dev.write_block(*block, rec.as_bytes())?;
    }
    Ok(())
}

/// Releases the staging list without writing it. Used when a layer is
/// being discarded.
pub fn invalidate_inode_pages(layer: &Layer) {
    let mut state = layer.flush.lock();
    if state.staging.is_empty() {
        return;
    }
    let pages: Vec<_> = state.staging.drain(..).collect();
    drop(state);
    layer.gfs().pager.release(layer, pages);
}
