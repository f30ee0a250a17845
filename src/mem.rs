//! In-memory reference backend.
//!
//! A self-contained stand-in for the block device, allocator and page
//! cache, good enough to mount, mutate, sync and remount a layer chain
//! without real storage. The integration tests run on it; embedders can
//! use it for scratch filesystems.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::disk::Extent;
use crate::error::Result;
use crate::inode::{InodeInner, Payload};
use crate::io::{check_block_buf, BlockAlloc, BlockIo, Page, PageIo};
use crate::layer::Layer;

/// Sparse block store. Unwritten blocks read back as zeros.
pub struct MemDisk {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
        })
    }

    /// Raw contents of one block, if it was ever written.
    pub fn snapshot(&self, block: u64) -> Option<Vec<u8>> {
        self.blocks.lock().get(&block).cloned()
    }

    pub fn is_written(&self, block: u64) -> bool {
        self.blocks.lock().contains_key(&block)
    }
}

impl BlockIo for MemDisk {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block_buf(buf);
        match self.blocks.lock().get(&block) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.iter_mut().for_each(|b| *b = 0),
        }
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        check_block_buf(buf);
        self.blocks.lock().insert(block, buf.to_vec());
        Ok(())
    }
}

/// Bump allocator handing out ascending contiguous runs. Frees are
/// recorded, not recycled.
pub struct RunAlloc {
    next: AtomicU64,
    freed: Mutex<Vec<Extent>>,
}

impl RunAlloc {
    pub fn new(start: u64) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(start),
            freed: Mutex::new(Vec::new()),
        })
    }

    /// Moves the allocation cursor; the next run starts here. Lets a
    /// caller force a discontinuity between runs.
    pub fn set_next(&self, block: u64) {
        self.next.store(block, Ordering::Release);
    }

    pub fn freed(&self) -> Vec<Extent> {
        self.freed.lock().clone()
    }
}

impl BlockAlloc for RunAlloc {
    fn alloc_meta(&self, _layer: &Layer, count: u64, _exact: bool) -> Result<u64> {
        Ok(self.next.fetch_add(count, Ordering::AcqRel))
    }

    fn free_meta(&self, _layer: &Layer, extents: &[Extent], _update_super: bool) {
        self.freed.lock().extend_from_slice(extents);
    }
}

/// Write-through pager that remembers every cluster it was handed.
pub struct WritebackPager {
    dev: Arc<dyn BlockIo>,
    clusters: Mutex<Vec<(u64, usize)>>,
    released: AtomicU64,
}

impl WritebackPager {
    pub fn new(dev: Arc<dyn BlockIo>) -> Arc<Self> {
        Arc::new(Self {
            dev,
            clusters: Mutex::new(Vec::new()),
            released: AtomicU64::new(0),
        })
    }

    /// Every flushed cluster as `(first block, length)`, in order.
    pub fn clusters(&self) -> Vec<(u64, usize)> {
        self.clusters.lock().clone()
    }

    /// Pages discarded without a write.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }
}

impl PageIo for WritebackPager {
    fn page_new_data(&self, _layer: &Layer, block: u64) -> Page {
        Page::zeroed(block)
    }

    fn flush_cluster(&self, _layer: &Layer, pages: &[Page]) -> Result<()> {
        assert!(!pages.is_empty());
        for pair in pages.windows(2) {
            assert_eq!(pair[1].block, pair[0].block + 1, "cluster not contiguous");
        }
        for page in pages {
            self.dev.write_block(page.block, page.data.bytes())?;
        }
        self.clusters.lock().push((pages[0].block, pages.len()));
        Ok(())
    }

    fn release(&self, _layer: &Layer, pages: Vec<Page>) {
        self.released
            .fetch_add(pages.len() as u64, Ordering::AcqRel);
    }

    fn trunc_pages(&self, _layer: &Layer, inode: &mut InodeInner, offset: u64) {
        if let Payload::Regular { pages, .. } = &mut inode.payload {
            // The dirty list is not keyed by file offset here; only a
            // full truncate releases pages.
            if offset == 0 {
                self.released
                    .fetch_add(pages.len() as u64, Ordering::AcqRel);
                pages.clear();
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn scratch_layer() -> Arc<Layer> {
    use crate::io::NullPayload;
    use crate::layer::Gfs;
    use crate::param::{INVALID_BLOCK, ROOT_INO};

    let disk = MemDisk::new();
    let pager = WritebackPager::new(disk.clone());
    let gfs = Gfs::new(disk, RunAlloc::new(1000), pager, Arc::new(NullPayload));
    Layer::new(gfs, 0, ROOT_INO, INVALID_BLOCK, None)
}
