//! Mount-time inode loader.
//!
//! Walks the layer's indirect chain of inode-block records, turning
//! each live child block into a resident record. Tombstoned children
//! (mode zero) are reclaimed on the way: the block goes back to the
//! allocator, the slot is stamped invalid, and the record is rewritten
//! in place before the walk advances.

use std::sync::Arc;

use log::info;
use zerocopy::AsBytes;

use crate::disk::{mode, BlockBuf, Dinode, Extent, InodeBlocks, DINODE_SIZE};
use crate::error::Result;
use crate::inode::{Inode, InodeFlags, Payload};
use crate::layer::Layer;
use crate::param::{IBLOCK_MAX, INVALID_BLOCK};

/// Populates a layer's cache from disk. Returns the number of inodes
/// instantiated. A layer whose chain head is unset loads nothing; its
/// root is installed separately by `layer::root_init`.
pub fn read_inodes(layer: &Layer) -> Result<u64> {
    let gfs = layer.gfs();
    let mut block = layer
        .sb
        .inode_block
        .load(std::sync::atomic::Ordering::Acquire);
    let chain_present = block != INVALID_BLOCK;
    let mut count: u64 = 0;
    info!(
        "reading inodes for layer {} root {}",
        layer.gindex(),
        layer.root()
    );

    if chain_present {
        // One block-aligned scratch buffer for the record, one for the
        // child, reused across the whole chain.
        let mut rec = InodeBlocks::empty();
        let mut ibuf = BlockBuf::boxed();

        while block != INVALID_BLOCK {
            gfs.dev.read_block(block, rec.as_bytes_mut())?;
            let mut rewrite = false;

            for slot in 0..IBLOCK_MAX {
                let iblock = rec.blocks[slot];
                if iblock == 0 {
                    break;
                }
                if iblock == INVALID_BLOCK {
                    continue;
                }
                gfs.dev.read_block(iblock, ibuf.bytes_mut())?;
                let dinode = Dinode::parse(&ibuf);
                if dinode.is_tombstone() {
                    gfs.alloc.free_meta(layer, &[Extent::new(iblock, 1)], true);
                    rec.blocks[slot] = INVALID_BLOCK;
                    rewrite = true;
                    continue;
                }
                load_inode(layer, dinode, iblock, &ibuf)?;
                count += 1;
            }

            if rewrite {
                gfs.dev.write_block(block, rec.as_bytes())?;
            }
            block = rec.next;
        }
    }

    if chain_present {
        assert!(
            layer.root_inode().is_some(),
            "layer {} has no root inode after load",
            layer.gindex()
        );
    }
    info!("loaded {} inodes in layer {}", count, layer.gindex());
    Ok(count)
}

/// Instantiates one record and dispatches its secondary reads by type.
fn load_inode(layer: &Layer, dinode: Dinode, iblock: u64, ibuf: &BlockBuf) -> Result<()> {
    let gfs = layer.gfs();
    let mode_bits = dinode.mode;
    let ino = dinode.ino;

    let payload = if mode::is_lnk(mode_bits) {
        // The target bytes sit right after the record, length `size`.
        let len = dinode.size as usize;
        let target: Arc<[u8]> = Arc::from(&ibuf.bytes()[DINODE_SIZE..DINODE_SIZE + len]);
        Payload::Symlink(Some(target))
    } else {
        Payload::for_mode(mode_bits)
    };

    let inode = Inode::from_parts(dinode, iblock, payload, None, InodeFlags::empty());
    layer.note_loaded_inode();
    let inode = layer.icache().add(layer, inode);

    {
        let mut guard = Inode::lock(&inode, true);
        if mode::is_reg(mode_bits) {
            gfs.payload.bmap_read(layer, guard.inner_mut(), ibuf)?;
        } else if mode::is_dir(mode_bits) {
            gfs.payload.dir_read(layer, guard.inner_mut(), ibuf)?;
        }
        gfs.payload.xattr_read(layer, guard.inner_mut(), ibuf)?;
    }

    if ino == layer.root() {
        assert!(mode::is_dir(mode_bits), "layer root is not a directory");
        layer.set_root_inode(inode);
    }
    Ok(())
}
