//! File-backed leaf device using positional `pread`/`pwrite` style I/O.

use crate::{BlockIo, ControlCommand, check_block_transfer, check_byte_access};
use cachet_error::{CachetError, Result};
use cachet_types::{AccessMode, BlockNumber, DeviceParams};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// File-backed block device.
///
/// Uses `FileExt` positional I/O, which is thread-safe and needs no
/// shared seek position. Opens read-write when possible, falling back
/// to read-only.
pub struct FileDisk {
    file: Arc<File>,
    block_count: u64,
    bytes_per_block: u32,
    writable: bool,
    mode: Mutex<AccessMode>,
    ready_changed: AtomicBool,
}

impl FileDisk {
    /// Open `path` as a block device with the given block size.
    ///
    /// The file length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>, bytes_per_block: u32) -> Result<Self> {
        if bytes_per_block == 0 || !bytes_per_block.is_power_of_two() {
            return Err(CachetError::InvalidRequest(format!(
                "block size {bytes_per_block} is not a power of two"
            )));
        }
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;

        let len = file.metadata()?.len();
        if len % u64::from(bytes_per_block) != 0 {
            return Err(CachetError::InvalidRequest(format!(
                "file length {len} is not a multiple of block size {bytes_per_block}"
            )));
        }

        tracing::debug!(
            target: "cachet::device",
            path = %path.as_ref().display(),
            blocks = len / u64::from(bytes_per_block),
            writable,
            "opened file disk"
        );
        Ok(Self {
            file: Arc::new(file),
            block_count: len / u64::from(bytes_per_block),
            bytes_per_block,
            writable,
            mode: Mutex::new(if writable {
                AccessMode::ReadWrite
            } else {
                AccessMode::ReadOnly
            }),
            ready_changed: AtomicBool::new(false),
        })
    }

    fn offset_of(&self, block: BlockNumber, offset: u32) -> u64 {
        block.0 * u64::from(self.bytes_per_block) + u64::from(offset)
    }

    fn require_writable(&self) -> Result<()> {
        if !self.writable || !self.mode().allows_write() {
            return Err(CachetError::InvalidRequest("device is read-only".to_owned()));
        }
        Ok(())
    }
}

impl BlockIo for FileDisk {
    fn read_blocks(&self, start: BlockNumber, count: u32, buf: &mut [u8]) -> Result<()> {
        check_block_transfer(&self.params(), start, count, buf.len())?;
        if !self.mode().allows_read() {
            return Err(CachetError::InvalidRequest(
                "device is write-only".to_owned(),
            ));
        }
        self.file.read_exact_at(buf, self.offset_of(start, 0))?;
        Ok(())
    }

    fn write_blocks(&self, start: BlockNumber, count: u32, buf: &[u8]) -> Result<()> {
        check_block_transfer(&self.params(), start, count, buf.len())?;
        self.require_writable()?;
        self.file.write_all_at(buf, self.offset_of(start, 0))?;
        Ok(())
    }

    fn read_bytes(&self, block: BlockNumber, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_byte_access(&self.params(), block, offset, buf.len())?;
        if !self.mode().allows_read() {
            return Err(CachetError::InvalidRequest(
                "device is write-only".to_owned(),
            ));
        }
        self.file.read_exact_at(buf, self.offset_of(block, offset))?;
        Ok(())
    }

    fn write_bytes(&self, block: BlockNumber, offset: u32, buf: &[u8]) -> Result<()> {
        check_byte_access(&self.params(), block, offset, buf.len())?;
        self.require_writable()?;
        self.file
            .write_all_at(buf, self.offset_of(block, offset))?;
        Ok(())
    }

    fn copy_blocks(&self, src: BlockNumber, dst: BlockNumber, count: u32) -> Result<()> {
        let len = usize::try_from(u64::from(count) * u64::from(self.bytes_per_block))
            .map_err(|_| CachetError::InvalidRequest("copy length does not fit usize".to_owned()))?;
        check_block_transfer(&self.params(), src, count, len)?;
        check_block_transfer(&self.params(), dst, count, len)?;
        self.require_writable()?;

        let mut buf = vec![0_u8; len];
        self.file.read_exact_at(&mut buf, self.offset_of(src, 0))?;
        self.file.write_all_at(&buf, self.offset_of(dst, 0))?;
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
            ControlCommand::Flush(_) => {
                if self.writable {
                    self.file.sync_all()?;
                }
                Ok(())
            }
            ControlCommand::Eject => Err(CachetError::InvalidRequest(
                "device is not removable".to_owned(),
            )),
            ControlCommand::LockMedia
            | ControlCommand::UnlockMedia
            | ControlCommand::InvalidateAll
            | ControlCommand::AllocScratch(_) => Ok(()),
        }
    }

    fn params(&self) -> DeviceParams {
        DeviceParams {
            removable: false,
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
        if mode.allows_write() && !self.writable {
            return Err(CachetError::InvalidRequest(
                "file was opened read-only".to_owned(),
            ));
        }
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

impl std::fmt::Debug for FileDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDisk")
            .field("block_count", &self.block_count)
            .field("bytes_per_block", &self.bytes_per_block)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0_u8; 8 * 512]).unwrap();

        let disk = FileDisk::open(&path, 512).unwrap();
        assert_eq!(disk.params().block_count, 8);

        disk.write_blocks(BlockNumber(2), 1, &[0xC3_u8; 512]).unwrap();
        let mut buf = vec![0_u8; 512];
        disk.read_blocks(BlockNumber(2), 1, &mut buf).unwrap();
        assert_eq!(buf, vec![0xC3_u8; 512]);
    }

    #[test]
    fn rejects_unaligned_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.img");
        std::fs::write(&path, vec![0_u8; 1000]).unwrap();
        assert!(FileDisk::open(&path, 512).is_err());
    }

    #[test]
    fn copy_blocks_duplicates_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.img");
        std::fs::write(&path, vec![0_u8; 4 * 512]).unwrap();

        let disk = FileDisk::open(&path, 512).unwrap();
        disk.write_blocks(BlockNumber(0), 1, &[9_u8; 512]).unwrap();
        disk.copy_blocks(BlockNumber(0), BlockNumber(3), 1).unwrap();

        let mut buf = vec![0_u8; 512];
        disk.read_blocks(BlockNumber(3), 1, &mut buf).unwrap();
        assert_eq!(buf, vec![9_u8; 512]);
    }
}
