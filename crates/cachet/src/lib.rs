#![forbid(unsafe_code)]
//! Public API facade for the cachet block-cache stack.
//!
//! Re-exports the cache engine, the block-device capability set with
//! its leaf devices, and the shared types and error enum, so downstream
//! consumers depend on this one crate.
//!
//! ```no_run
//! use cachet::{BlockIo, BlockNumber, CacheDevice, CacheOptions, RamDisk};
//!
//! let disk = RamDisk::new(1024, 512);
//! let cache = CacheDevice::new(disk, CacheOptions::new(64 * 1024))?;
//! cache.write_blocks(BlockNumber(7), 1, &[0u8; 512])?;
//! cache.flush()?;
//! # Ok::<(), cachet::CachetError>(())
//! ```

pub use cachet_core::*;
pub use cachet_device::{
    BlockCookie, BlockIo, ControlCommand, FileDisk, FlushWhen, RamDisk, check_block_transfer,
    check_byte_access,
};
pub use cachet_error::{CachetError, Result};
pub use cachet_types::{
    AccessMode, BlockNumber, BlockRange, DeviceParams, TunedMask, Tuning, TuningUpdate,
};
