//! Block device seam.
//!
//! The node manager sees the device as a flat array of fixed-size blocks.
//! Production wires a real queue here; tests use [`MemDisk`], which can also
//! inject write failures to drive the checkpoint error paths.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::param::BlockAddr;
use crate::util::unpoison;

pub trait BlockDevice: Send + Sync {
    fn read_block(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, addr: BlockAddr, buf: &[u8]) -> Result<()>;
    fn block_size(&self) -> usize;
    fn nblocks(&self) -> u32;
}

/// RAM-backed device.
pub struct MemDisk {
    blocks: Mutex<Vec<Box<[u8]>>>,
    block_size: usize,
    /// Remaining writes before every further write fails with EIO.
    /// `u32::MAX` means never fail.
    write_budget: AtomicU32,
}

impl MemDisk {
    pub fn new(nblocks: u32, block_size: usize) -> Self {
        let blocks = (0..nblocks)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();
        Self {
            blocks: Mutex::new(blocks),
            block_size,
            write_budget: AtomicU32::new(u32::MAX),
        }
    }

    /// Makes every write after the next `n` fail with EIO.
    pub fn fail_writes_after(&self, n: u32) {
        self.write_budget.store(n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.write_budget.store(u32::MAX, Ordering::SeqCst);
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        let blocks = unpoison(self.blocks.lock());
        let block = blocks.get(addr as usize).ok_or(Error::Eio)?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&self, addr: BlockAddr, buf: &[u8]) -> Result<()> {
        if self.write_budget.load(Ordering::SeqCst) != u32::MAX {
            let left = self.write_budget.fetch_sub(1, Ordering::SeqCst);
            if left == 0 {
                self.write_budget.store(0, Ordering::SeqCst);
                return Err(Error::Eio);
            }
        }
        let mut blocks = unpoison(self.blocks.lock());
        let block = blocks.get_mut(addr as usize).ok_or(Error::Eio)?;
        block.copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn nblocks(&self) -> u32 {
        unpoison(self.blocks.lock()).len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let disk = MemDisk::new(4, 32);
        let data = [7u8; 32];
        disk.write_block(2, &data).unwrap();
        let mut out = [0u8; 32];
        disk.read_block(2, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn write_failure_injection() {
        let disk = MemDisk::new(4, 32);
        disk.fail_writes_after(1);
        assert!(disk.write_block(0, &[0u8; 32]).is_ok());
        assert_eq!(disk.write_block(1, &[0u8; 32]), Err(Error::Eio));
        disk.heal();
        assert!(disk.write_block(1, &[0u8; 32]).is_ok());
    }

    #[test]
    fn out_of_range_is_eio() {
        let disk = MemDisk::new(2, 32);
        let mut buf = [0u8; 32];
        assert_eq!(disk.read_block(9, &mut buf), Err(Error::Eio));
    }
}
