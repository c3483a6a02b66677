//! Memory-backed leaf device.

use crate::{BlockIo, ControlCommand, check_block_transfer, check_byte_access};
use cachet_error::{CachetError, Result};
use cachet_types::{AccessMode, BlockNumber, DeviceParams};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// RAM-backed block device.
///
/// The storage is a single `Vec<u8>` behind a mutex. Useful as the leaf
/// of a test stack and as a scratch volume; the `removable` flavor also
/// models a medium that can be ejected or swapped underneath a cache.
pub struct RamDisk {
    storage: Mutex<Vec<u8>>,
    block_count: u64,
    bytes_per_block: u32,
    removable: bool,
    mode: Mutex<AccessMode>,
    ready_changed: AtomicBool,
    media_locked: AtomicBool,
}

impl RamDisk {
    /// Create a fixed (non-removable) RAM disk, zero-filled.
    #[must_use]
    pub fn new(block_count: u64, bytes_per_block: u32) -> Self {
        Self::build(block_count, bytes_per_block, false)
    }

    /// Create a removable RAM disk, zero-filled.
    #[must_use]
    pub fn removable(block_count: u64, bytes_per_block: u32) -> Self {
        Self::build(block_count, bytes_per_block, true)
    }

    fn build(block_count: u64, bytes_per_block: u32, removable: bool) -> Self {
        let len = usize::try_from(block_count * u64::from(bytes_per_block))
            .expect("ram disk size fits usize");
        Self {
            storage: Mutex::new(vec![0_u8; len]),
            block_count,
            bytes_per_block,
            removable,
            mode: Mutex::new(AccessMode::ReadWrite),
            ready_changed: AtomicBool::new(false),
            media_locked: AtomicBool::new(false),
        }
    }

    /// Raw copy of one block, for observing the medium beneath a cache.
    #[must_use]
    pub fn snapshot_block(&self, block: BlockNumber) -> Vec<u8> {
        let bs = self.bytes_per_block as usize;
        let start = usize::try_from(block.0).expect("block fits usize") * bs;
        self.storage.lock()[start..start + bs].to_vec()
    }

    fn byte_range(&self, block: BlockNumber, offset: u32, len: usize) -> (usize, usize) {
        let start = usize::try_from(block.0 * u64::from(self.bytes_per_block) + u64::from(offset))
            .expect("offset fits usize");
        (start, start + len)
    }
}

impl BlockIo for RamDisk {
    fn read_blocks(&self, start: BlockNumber, count: u32, buf: &mut [u8]) -> Result<()> {
        check_block_transfer(&self.params(), start, count, buf.len())?;
        if !self.mode().allows_read() {
            return Err(CachetError::InvalidRequest(
                "device is write-only".to_owned(),
            ));
        }
        let (lo, hi) = self.byte_range(start, 0, buf.len());
        buf.copy_from_slice(&self.storage.lock()[lo..hi]);
        Ok(())
    }

    fn write_blocks(&self, start: BlockNumber, count: u32, buf: &[u8]) -> Result<()> {
        check_block_transfer(&self.params(), start, count, buf.len())?;
        if !self.mode().allows_write() {
            return Err(CachetError::InvalidRequest("device is read-only".to_owned()));
        }
        let (lo, hi) = self.byte_range(start, 0, buf.len());
        self.storage.lock()[lo..hi].copy_from_slice(buf);
        Ok(())
    }

    fn read_bytes(&self, block: BlockNumber, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_byte_access(&self.params(), block, offset, buf.len())?;
        if !self.mode().allows_read() {
            return Err(CachetError::InvalidRequest(
                "device is write-only".to_owned(),
            ));
        }
        let (lo, hi) = self.byte_range(block, offset, buf.len());
        buf.copy_from_slice(&self.storage.lock()[lo..hi]);
        Ok(())
    }

    fn write_bytes(&self, block: BlockNumber, offset: u32, buf: &[u8]) -> Result<()> {
        check_byte_access(&self.params(), block, offset, buf.len())?;
        if !self.mode().allows_write() {
            return Err(CachetError::InvalidRequest("device is read-only".to_owned()));
        }
        let (lo, hi) = self.byte_range(block, offset, buf.len());
        self.storage.lock()[lo..hi].copy_from_slice(buf);
        Ok(())
    }

    fn copy_blocks(&self, src: BlockNumber, dst: BlockNumber, count: u32) -> Result<()> {
        let bs = usize::try_from(self.bytes_per_block)
            .map_err(|_| CachetError::InvalidRequest("block size does not fit usize".to_owned()))?;
        let len = bs * count as usize;
        check_block_transfer(&self.params(), src, count, len)?;
        check_block_transfer(&self.params(), dst, count, len)?;
        if !self.mode().allows_write() {
            return Err(CachetError::InvalidRequest("device is read-only".to_owned()));
        }
        let (src_lo, _) = self.byte_range(src, 0, len);
        let (dst_lo, _) = self.byte_range(dst, 0, len);
        self.storage
            .lock()
            .copy_within(src_lo..src_lo + len, dst_lo);
        Ok(())
    }

    fn control(&self, cmd: ControlCommand) -> Result<()> {
        match cmd {
            ControlCommand::Reset => {
                self.ready_changed.store(false, Ordering::SeqCst);
                Ok(())
            }
            ControlCommand::StatusCheck => {
                if self.ready_changed.load(Ordering::SeqCst) {
                    Err(CachetError::MediaNotPresent)
                } else {
                    Ok(())
                }
            }
            ControlCommand::LockMedia => {
                self.media_locked.store(true, Ordering::SeqCst);
                Ok(())
            }
            ControlCommand::UnlockMedia => {
                self.media_locked.store(false, Ordering::SeqCst);
                Ok(())
            }
            ControlCommand::Eject => {
                if !self.removable {
                    return Err(CachetError::InvalidRequest(
                        "device is not removable".to_owned(),
                    ));
                }
                if self.media_locked.load(Ordering::SeqCst) {
                    return Err(CachetError::InvalidRequest("media is locked".to_owned()));
                }
                self.ready_changed.store(true, Ordering::SeqCst);
                Ok(())
            }
            // Cache-level commands are no-ops on a leaf.
            ControlCommand::Flush(_)
            | ControlCommand::InvalidateAll
            | ControlCommand::AllocScratch(_) => Ok(()),
        }
    }

    fn params(&self) -> DeviceParams {
        DeviceParams {
            removable: self.removable,
            block_count: self.block_count,
            bytes_per_block: self.bytes_per_block,
            block_offset: 0,
            blocks_per_track: 0,
            heads: 0,
            last_error_block: None,
            last_error: None,
        }
    }

    fn mode(&self) -> AccessMode {
        *self.mode.lock()
    }

    fn set_mode(&self, mode: AccessMode) -> Result<()> {
        *self.mode.lock() = mode;
        Ok(())
    }

    fn ready_changed(&self) -> bool {
        self.ready_changed.load(Ordering::SeqCst)
    }

    fn set_ready_changed(&self, changed: bool) {
        self.ready_changed.store(changed, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RamDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamDisk")
            .field("block_count", &self.block_count)
            .field("bytes_per_block", &self.bytes_per_block)
            .field("removable", &self.removable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let disk = RamDisk::new(8, 512);
        disk.write_blocks(BlockNumber(3), 2, &[0x5A_u8; 1024]).unwrap();

        let mut buf = vec![0_u8; 1024];
        disk.read_blocks(BlockNumber(3), 2, &mut buf).unwrap();
        assert_eq!(buf, vec![0x5A_u8; 1024]);

        // Neighbors untouched.
        assert_eq!(disk.snapshot_block(BlockNumber(2)), vec![0_u8; 512]);
        assert_eq!(disk.snapshot_block(BlockNumber(5)), vec![0_u8; 512]);
    }

    #[test]
    fn byte_access_within_block() {
        let disk = RamDisk::new(4, 512);
        disk.write_bytes(BlockNumber(1), 100, b"hello").unwrap();

        let mut buf = [0_u8; 5];
        disk.read_bytes(BlockNumber(1), 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        assert!(disk.read_bytes(BlockNumber(1), 510, &mut buf).is_err());
    }

    #[test]
    fn copy_blocks_moves_content() {
        let disk = RamDisk::new(8, 512);
        disk.write_blocks(BlockNumber(0), 1, &[7_u8; 512]).unwrap();
        disk.copy_blocks(BlockNumber(0), BlockNumber(6), 1).unwrap();
        assert_eq!(disk.snapshot_block(BlockNumber(6)), vec![7_u8; 512]);
    }

    #[test]
    fn mode_is_enforced() {
        let disk = RamDisk::new(4, 512);
        disk.set_mode(AccessMode::ReadOnly).unwrap();
        assert!(disk.write_blocks(BlockNumber(0), 1, &[0_u8; 512]).is_err());

        disk.set_mode(AccessMode::WriteOnly).unwrap();
        let mut buf = [0_u8; 512];
        assert!(disk.read_blocks(BlockNumber(0), 1, &mut buf).is_err());
    }

    #[test]
    fn eject_raises_sticky_flag_until_reset() {
        let disk = RamDisk::removable(4, 512);
        assert!(disk.control(ControlCommand::StatusCheck).is_ok());

        disk.control(ControlCommand::Eject).unwrap();
        assert!(disk.ready_changed());
        assert!(matches!(
            disk.control(ControlCommand::StatusCheck),
            Err(CachetError::MediaNotPresent)
        ));

        disk.control(ControlCommand::Reset).unwrap();
        assert!(!disk.ready_changed());
        assert!(disk.control(ControlCommand::StatusCheck).is_ok());
    }

    #[test]
    fn locked_media_cannot_eject() {
        let disk = RamDisk::removable(4, 512);
        disk.control(ControlCommand::LockMedia).unwrap();
        assert!(disk.control(ControlCommand::Eject).is_err());
        disk.control(ControlCommand::UnlockMedia).unwrap();
        assert!(disk.control(ControlCommand::Eject).is_ok());
    }

    #[test]
    fn fixed_disk_cannot_eject() {
        let disk = RamDisk::new(4, 512);
        assert!(disk.control(ControlCommand::Eject).is_err());
    }
}
