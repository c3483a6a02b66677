#![forbid(unsafe_code)]
//! Block-device capability set for the cachet stack.
//!
//! Every layer in the stack is block-device-shaped on both sides: it
//! implements [`BlockIo`] for its callers and drives a subordinate
//! [`BlockIo`] underneath. That makes layers stackable — a cache over a
//! partition over a disk, or a cache over another cache.
//!
//! Two leaf devices live here: [`RamDisk`] (memory-backed, used by
//! tests and benchmarks, optionally removable) and [`FileDisk`]
//! (file-backed positional I/O).

use cachet_error::{CachetError, Result};
use cachet_types::{AccessMode, BlockNumber, DeviceParams};
use std::time::Duration;

mod file;
mod ram;

pub use file::FileDisk;
pub use ram::RamDisk;

/// When a `Flush` control command should take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushWhen {
    /// Flush before the call returns.
    Now,
    /// Flush within the given delay (pulls the sync deadline earlier).
    Within(Duration),
    /// Flush now if there is dirty work, otherwise do nothing.
    Opportunistic,
}

/// Control-channel commands.
///
/// A layer handles the variants it understands and forwards the rest to
/// its subordinate; leaf devices treat cache-level commands as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Clear error state, including the sticky ready-changed flag.
    Reset,
    /// Verify the device is ready; fails with `MediaNotPresent` when the
    /// ready-changed flag is set.
    StatusCheck,
    /// Prevent medium removal.
    LockMedia,
    /// Allow medium removal.
    UnlockMedia,
    /// Eject the medium.
    Eject,
    /// Flush pending writes.
    Flush(FlushWhen),
    /// Drop all cached state without writing it back.
    InvalidateAll,
    /// Materialize a zero-filled block without reading the medium.
    AllocScratch(BlockNumber),
}

/// Fast-path cookie for repeated sub-block access to one block.
///
/// A caller may retain the cookie returned alongside a byte access and
/// replay it on the immediately following access to the same block
/// number; the device validates it and skips the index lookup when it
/// still refers to that block. Contents are meaningful only to the
/// device that produced the cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCookie {
    /// Block number the cookie was minted for.
    pub block: BlockNumber,
    /// Device-private slot hint.
    pub slot: u64,
}

/// The block-device capability set.
///
/// All methods take `&self`; implementations guard their state
/// internally so a device handle can be shared across threads.
pub trait BlockIo: Send + Sync {
    /// Read `count` whole blocks starting at `start` into `buf`.
    ///
    /// `buf.len()` must equal `count * bytes_per_block`.
    fn read_blocks(&self, start: BlockNumber, count: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `count` whole blocks starting at `start` from `buf`.
    fn write_blocks(&self, start: BlockNumber, count: u32, buf: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes from `offset` within one block.
    fn read_bytes(&self, block: BlockNumber, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len()` bytes at `offset` within one block.
    fn write_bytes(&self, block: BlockNumber, offset: u32, buf: &[u8]) -> Result<()>;

    /// Copy `count` blocks from `src` to `dst` within the device.
    fn copy_blocks(&self, src: BlockNumber, dst: BlockNumber, count: u32) -> Result<()>;

    /// Dispatch a control command.
    fn control(&self, cmd: ControlCommand) -> Result<()>;

    /// Geometry and status parameters.
    fn params(&self) -> DeviceParams;

    /// Current access mode.
    fn mode(&self) -> AccessMode;

    /// Change the access mode.
    fn set_mode(&self, mode: AccessMode) -> Result<()>;

    /// Sticky media-change flag. Cleared only by [`ControlCommand::Reset`].
    fn ready_changed(&self) -> bool;

    /// Raise or clear the media-change flag out of band.
    fn set_ready_changed(&self, changed: bool);

    /// [`Self::read_bytes`] with an optional fast-path cookie. Devices
    /// without an index ignore the cookie.
    fn read_bytes_cookie(
        &self,
        block: BlockNumber,
        offset: u32,
        buf: &mut [u8],
        _cookie: Option<&mut BlockCookie>,
    ) -> Result<()> {
        self.read_bytes(block, offset, buf)
    }

    /// [`Self::write_bytes`] with an optional fast-path cookie.
    fn write_bytes_cookie(
        &self,
        block: BlockNumber,
        offset: u32,
        buf: &[u8],
        _cookie: Option<&mut BlockCookie>,
    ) -> Result<()> {
        self.write_bytes(block, offset, buf)
    }
}

/// Validate a whole-block transfer against device geometry and buffer
/// length. Shared by the leaf devices and the cache layer.
pub fn check_block_transfer(
    params: &DeviceParams,
    start: BlockNumber,
    count: u32,
    buf_len: usize,
) -> Result<()> {
    let end = start
        .0
        .checked_add(u64::from(count))
        .ok_or_else(|| CachetError::InvalidRequest("block range overflows u64".to_owned()))?;
    if end > params.block_count {
        return Err(CachetError::InvalidRequest(format!(
            "blocks {}..{} out of range (device has {})",
            start.0, end, params.block_count
        )));
    }
    let expected = u64::from(count) * u64::from(params.bytes_per_block);
    if buf_len as u64 != expected {
        return Err(CachetError::InvalidRequest(format!(
            "buffer length {buf_len} does not match {count} blocks of {} bytes",
            params.bytes_per_block
        )));
    }
    Ok(())
}

/// Validate a sub-block byte access.
pub fn check_byte_access(
    params: &DeviceParams,
    block: BlockNumber,
    offset: u32,
    len: usize,
) -> Result<()> {
    if block.0 >= params.block_count {
        return Err(CachetError::InvalidRequest(format!(
            "block {} out of range (device has {})",
            block.0, params.block_count
        )));
    }
    let end = u64::from(offset) + len as u64;
    if end > u64::from(params.bytes_per_block) {
        return Err(CachetError::InvalidRequest(format!(
            "byte range {offset}..{end} exceeds block size {}",
            params.bytes_per_block
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DeviceParams {
        DeviceParams {
            removable: false,
            block_count: 16,
            bytes_per_block: 512,
            block_offset: 0,
            blocks_per_track: 0,
            heads: 0,
            last_error_block: None,
            last_error: None,
        }
    }

    #[test]
    fn block_transfer_bounds() {
        let p = params();
        assert!(check_block_transfer(&p, BlockNumber(0), 16, 16 * 512).is_ok());
        assert!(check_block_transfer(&p, BlockNumber(15), 2, 2 * 512).is_err());
        assert!(check_block_transfer(&p, BlockNumber(0), 1, 100).is_err());
        assert!(check_block_transfer(&p, BlockNumber(u64::MAX), 1, 512).is_err());
    }

    #[test]
    fn byte_access_bounds() {
        let p = params();
        assert!(check_byte_access(&p, BlockNumber(3), 500, 12).is_ok());
        assert!(check_byte_access(&p, BlockNumber(3), 500, 13).is_err());
        assert!(check_byte_access(&p, BlockNumber(16), 0, 1).is_err());
    }
}
