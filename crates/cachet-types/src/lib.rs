#![forbid(unsafe_code)]
//! Shared newtypes and the tunable-parameter model for the cachet stack.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical block address on a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Offset this block number forward, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range of block numbers `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    start: u64,
    end: u64,
}

impl BlockRange {
    /// Range covering the whole 64-bit block address space.
    #[must_use]
    pub fn everything() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    /// Build a range from a start block and a count.
    ///
    /// Returns `None` if `start + count` overflows.
    #[must_use]
    pub fn from_start_count(start: BlockNumber, count: u64) -> Option<Self> {
        start.0.checked_add(count).map(|end| Self {
            start: start.0,
            end,
        })
    }

    /// Build a range from raw bounds. `end < start` is normalized to empty.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        (self.start..self.end).contains(&block.0)
    }
}

/// Access mode of a device, enforced at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn allows_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn allows_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Fallback forward-seek heuristic when the device reports no geometry.
const DEFAULT_CYLINDER_BLOCKS: u64 = 64;

/// Geometry and status parameters reported by a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Whether the medium can be removed while the device stays up.
    pub removable: bool,
    /// Total addressable blocks.
    pub block_count: u64,
    /// Bytes per block.
    pub bytes_per_block: u32,
    /// Offset of block 0 relative to the underlying medium (partitioned
    /// devices report a nonzero base).
    pub block_offset: u64,
    /// Blocks per track, zero when unreported.
    pub blocks_per_track: u32,
    /// Head count, zero when unreported.
    pub heads: u32,
    /// Block of the most recent device error, if any.
    pub last_error_block: Option<u64>,
    /// Human-readable detail of the most recent device error, if any.
    pub last_error: Option<String>,
}

impl DeviceParams {
    /// Blocks per cylinder, used to decide when a forward seek is large
    /// enough to justify flushing the blocks it skipped over.
    #[must_use]
    pub fn cylinder_blocks(&self) -> u64 {
        let cyl = u64::from(self.blocks_per_track) * u64::from(self.heads);
        if cyl == 0 { DEFAULT_CYLINDER_BLOCKS } else { cyl }
    }
}

/// Tunable parameters of one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    /// Ceiling on the number of dirty blocks before a forced flush pass.
    pub dirty_max: usize,
    /// Transfers of at least this many blocks skip the cache. Zero means
    /// every transfer bypasses (the disable mechanism).
    pub bypass_blocks: u32,
    /// Blocks to read ahead on a miss, before the capacity-derived caps.
    pub read_ahead: u32,
    /// How long dirty blocks may sit before the background task flushes
    /// them. `Duration::ZERO` means "flush immediately, always".
    pub sync_interval: Duration,
}

/// Which tuning fields were hand-set. A hand-tuned field is never
/// re-derived from the preset table on resize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunedMask {
    pub dirty_max: bool,
    pub bypass_blocks: bool,
    pub read_ahead: bool,
    pub sync_interval: bool,
}

/// A partial tuning change. `None` leaves the field unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningUpdate {
    pub dirty_max: Option<usize>,
    pub bypass_blocks: Option<u32>,
    pub read_ahead: Option<u32>,
    pub sync_interval: Option<Duration>,
}

/// Capacity-indexed defaults: (capacity ceiling, dirty max, bypass
/// threshold, read-ahead, sync interval seconds).
const PRESETS: &[(usize, usize, u32, u32, u64)] = &[
    (64, 16, 16, 8, 10),
    (256, 64, 32, 16, 30),
    (1024, 256, 64, 32, 60),
    (usize::MAX, 1024, 96, 64, 120),
];

/// Sync interval ceiling applied to removable media unless hand-tuned.
const REMOVABLE_SYNC_CAP: Duration = Duration::from_secs(1);

impl Tuning {
    /// Select defaults from the capacity-indexed preset table.
    ///
    /// Removable media get their sync interval capped at one second: a
    /// medium that can vanish should not carry minutes of dirty data.
    #[must_use]
    pub fn preset(capacity_blocks: usize, removable: bool) -> Self {
        let row = PRESETS
            .iter()
            .find(|(cap, ..)| capacity_blocks <= *cap)
            .unwrap_or(&PRESETS[PRESETS.len() - 1]);
        let (_, dirty, bypass, read_ahead, sync_secs) = *row;

        let mut sync_interval = Duration::from_secs(sync_secs);
        if removable {
            sync_interval = sync_interval.min(REMOVABLE_SYNC_CAP);
        }

        Self {
            // The ceiling must leave clean blocks to evict.
            dirty_max: dirty.min((capacity_blocks / 2).max(1)),
            bypass_blocks: bypass,
            read_ahead,
            sync_interval,
        }
    }

    /// Merge a partial update, recording each touched field in `mask`.
    pub fn apply(&mut self, update: TuningUpdate, mask: &mut TunedMask) {
        if let Some(dirty_max) = update.dirty_max {
            self.dirty_max = dirty_max;
            mask.dirty_max = true;
        }
        if let Some(bypass_blocks) = update.bypass_blocks {
            self.bypass_blocks = bypass_blocks;
            mask.bypass_blocks = true;
        }
        if let Some(read_ahead) = update.read_ahead {
            self.read_ahead = read_ahead;
            mask.read_ahead = true;
        }
        if let Some(sync_interval) = update.sync_interval {
            self.sync_interval = sync_interval;
            mask.sync_interval = true;
        }
    }

    /// Re-derive the fields that were never hand-tuned, after a resize.
    pub fn represet(&mut self, capacity_blocks: usize, removable: bool, mask: TunedMask) {
        let fresh = Self::preset(capacity_blocks, removable);
        if !mask.dirty_max {
            self.dirty_max = fresh.dirty_max;
        }
        if !mask.bypass_blocks {
            self.bypass_blocks = fresh.bypass_blocks;
        }
        if !mask.read_ahead {
            self.read_ahead = fresh.read_ahead;
        }
        if !mask.sync_interval {
            self.sync_interval = fresh.sync_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_from_start_count() {
        let r = BlockRange::from_start_count(BlockNumber(10), 4).unwrap();
        assert_eq!(r.len(), 4);
        assert!(r.contains(BlockNumber(10)));
        assert!(r.contains(BlockNumber(13)));
        assert!(!r.contains(BlockNumber(14)));

        assert!(BlockRange::from_start_count(BlockNumber(u64::MAX), 2).is_none());
    }

    #[test]
    fn range_everything_contains_extremes() {
        let all = BlockRange::everything();
        assert!(all.contains(BlockNumber(0)));
        assert!(all.contains(BlockNumber(u64::MAX - 1)));
    }

    #[test]
    fn access_mode_gates() {
        assert!(AccessMode::ReadOnly.allows_read());
        assert!(!AccessMode::ReadOnly.allows_write());
        assert!(!AccessMode::WriteOnly.allows_read());
        assert!(AccessMode::ReadWrite.allows_write());
    }

    #[test]
    fn cylinder_falls_back_when_geometry_unreported() {
        let mut params = DeviceParams {
            removable: false,
            block_count: 100,
            bytes_per_block: 512,
            block_offset: 0,
            blocks_per_track: 0,
            heads: 0,
            last_error_block: None,
            last_error: None,
        };
        assert_eq!(params.cylinder_blocks(), DEFAULT_CYLINDER_BLOCKS);

        params.blocks_per_track = 63;
        params.heads = 16;
        assert_eq!(params.cylinder_blocks(), 63 * 16);
    }

    #[test]
    fn presets_scale_with_capacity() {
        let small = Tuning::preset(32, false);
        let large = Tuning::preset(4096, false);
        assert!(small.dirty_max < large.dirty_max);
        assert!(small.read_ahead < large.read_ahead);
        assert!(small.sync_interval < large.sync_interval);
        // The ceiling always leaves room for clean blocks.
        assert!(small.dirty_max <= 16);
    }

    #[test]
    fn removable_caps_sync_interval() {
        let fixed = Tuning::preset(512, false);
        let removable = Tuning::preset(512, true);
        assert!(fixed.sync_interval > Duration::from_secs(1));
        assert_eq!(removable.sync_interval, Duration::from_secs(1));
    }

    #[test]
    fn apply_marks_only_touched_fields() {
        let mut tuning = Tuning::preset(256, false);
        let mut mask = TunedMask::default();

        tuning.apply(
            TuningUpdate {
                dirty_max: Some(5),
                sync_interval: Some(Duration::ZERO),
                ..TuningUpdate::default()
            },
            &mut mask,
        );

        assert_eq!(tuning.dirty_max, 5);
        assert_eq!(tuning.sync_interval, Duration::ZERO);
        assert!(mask.dirty_max);
        assert!(mask.sync_interval);
        assert!(!mask.bypass_blocks);
        assert!(!mask.read_ahead);
    }

    #[test]
    fn represet_preserves_hand_tuned_fields() {
        let mut tuning = Tuning::preset(256, false);
        let mut mask = TunedMask::default();
        tuning.apply(
            TuningUpdate {
                dirty_max: Some(7),
                ..TuningUpdate::default()
            },
            &mut mask,
        );

        tuning.represet(4096, false, mask);
        let fresh = Tuning::preset(4096, false);
        assert_eq!(tuning.dirty_max, 7);
        assert_eq!(tuning.bypass_blocks, fresh.bypass_blocks);
        assert_eq!(tuning.read_ahead, fresh.read_ahead);
        assert_eq!(tuning.sync_interval, fresh.sync_interval);
    }
}
