#![forbid(unsafe_code)]
//! Write-back block cache engine.
//!
//! [`CacheDevice`] wraps any [`BlockIo`] subordinate and is itself a
//! [`BlockIo`], so caches stack. It absorbs repeated and nearby
//! accesses in a fixed descriptor table, coalesces dirty blocks into
//! contiguous multi-block writes, reads ahead into a shared big buffer,
//! routes large transfers around the cache entirely, and watches
//! removable media for silent swaps via an anchor-block checksum.
//!
//! # Concurrency
//!
//! One `parking_lot::Mutex` per instance serializes all state mutation
//! *including subordinate I/O*: two callers against the same instance
//! never interleave, two instances proceed independently. Foreground
//! calls block for the lock; the background [`FlushDaemon`] only ever
//! `try_lock`s, so it cannot delay a foreground caller.

use cachet_device::{
    BlockCookie, BlockIo, ControlCommand, FlushWhen, check_block_transfer, check_byte_access,
};
use cachet_error::{CachetError, Result};
use cachet_types::{AccessMode, BlockNumber, BlockRange, DeviceParams, TunedMask, Tuning,
    TuningUpdate};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

mod daemon;
mod table;

pub use daemon::{BackgroundSweep, CacheRegistry, FlushDaemon, FlushDaemonConfig, SweepReport};

use table::{BlockState, CacheTable};

/// Bounded retries for the evict-flush-retry loop before giving up
/// with `ResourceExhausted`.
const EVICTION_RETRIES: usize = 10;

/// Default idle period after which a removable medium is re-verified.
const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(2);

/// Upper bound on the big-buffer share of the memory budget, in bytes.
const BIG_BUFFER_CAP_BYTES: usize = 256 * 1024;

/// Construction options for a [`CacheDevice`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Memory budget in bytes for descriptors, slot data, and the big
    /// buffer together.
    pub memory_bytes: usize,
    /// Label used in logs and diagnostics.
    pub label: String,
    /// Idle period after which removable media are re-verified against
    /// the anchor-block signature.
    pub idle_threshold: Duration,
}

impl CacheOptions {
    /// Options with the given memory budget and defaults for the rest.
    #[must_use]
    pub fn new(memory_bytes: usize) -> Self {
        Self {
            memory_bytes,
            label: "cachet".to_owned(),
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn idle_threshold(mut self, idle_threshold: Duration) -> Self {
        self.idle_threshold = idle_threshold;
        self
    }
}

/// Running statistics of one cache instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups resolved through the hash index.
    pub hash_hits: u64,
    pub hash_misses: u64,
    /// Lookups resolved by recency-list scan or a replayed cookie.
    pub recency_hits: u64,
    pub recency_misses: u64,
    /// Extra blocks pulled in by read-ahead (beyond the requested one).
    pub read_aheads: u64,
    /// Subordinate writes by cause: explicit flush calls and bypass
    /// reconciliation.
    pub writes_foreground: u64,
    /// Writes issued by the background flush task.
    pub writes_background: u64,
    /// Writes forced by the hidden-write rule before a forward seek.
    pub writes_hidden: u64,
    /// Writes forced by the dirty ceiling or eviction pressure.
    pub writes_forced: u64,
    /// Transfers routed around the cache.
    pub bypass_reads: u64,
    pub bypass_writes: u64,
    /// Snapshot of the current dirty count and table capacity.
    pub dirty_blocks: usize,
    pub capacity_blocks: usize,
}

impl CacheStats {
    /// Fraction of the table currently dirty, in `[0, 1]`.
    #[must_use]
    #[expect(clippy::cast_precision_loss)] // diagnostic ratio only
    pub fn dirty_fraction(&self) -> f64 {
        if self.capacity_blocks == 0 {
            0.0
        } else {
            self.dirty_blocks as f64 / self.capacity_blocks as f64
        }
    }
}

/// Why a flush write was issued, for the per-category counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteCategory {
    Foreground,
    Background,
    Hidden,
    Forced,
}

/// Mutable state of one instance, all guarded by one lock.
struct CacheState {
    table: CacheTable,
    /// Shared scratch for read-ahead and coalesced writes.
    big: Vec<u8>,
    big_blocks: usize,
    tuning: Tuning,
    tuned: TunedMask,
    stats: CacheStats,
    /// Number of descriptors in `Dirty` state. Invariant: always equal
    /// to the actual count.
    dirty: usize,
    /// Most recently accessed block, for the forward-seek heuristic.
    last_block: Option<u64>,
    last_activity: Instant,
    /// CRC32 of the anchor block, `None` until learned.
    signature: Option<u32>,
    /// Sticky media-change flag, cleared only by `Reset`.
    ready_changed: bool,
    /// Bypass threshold saved by `disable`, `Some` while disabled.
    disabled_bypass: Option<u32>,
    /// Deadline for the next background flush of this instance.
    next_sync: Instant,
    last_error: Option<(u64, String)>,
    mode: AccessMode,
}

/// Write-back cache over a subordinate block device.
pub struct CacheDevice<D: BlockIo> {
    dev: D,
    label: String,
    idle_threshold: Duration,
    /// Subordinate geometry, captured at construction.
    base: DeviceParams,
    block_size: usize,
    cylinder: u64,
    state: Mutex<CacheState>,
}

impl<D: BlockIo> CacheDevice<D> {
    /// Build a cache over `dev` with the given memory budget.
    ///
    /// The budget is split into fixed-size slots plus the big buffer (a
    /// capped fraction of the total); tunables come from the
    /// capacity-indexed preset table. For removable media the anchor
    /// signature is learned immediately, best effort.
    pub fn new(dev: D, options: CacheOptions) -> Result<Self> {
        let mut base = dev.params();
        base.last_error_block = None;
        base.last_error = None;

        let block_size = usize::try_from(base.bytes_per_block).map_err(|_| {
            CachetError::InvalidRequest("block size does not fit usize".to_owned())
        })?;
        if block_size == 0 {
            return Err(CachetError::InvalidRequest(
                "subordinate reports zero block size".to_owned(),
            ));
        }

        let total_blocks = options.memory_bytes / block_size;
        if total_blocks < 8 {
            return Err(CachetError::ResourceExhausted(format!(
                "memory budget {} holds fewer than 8 blocks of {} bytes",
                options.memory_bytes, block_size
            )));
        }
        let big_blocks = (total_blocks / 8)
            .clamp(1, (BIG_BUFFER_CAP_BYTES / block_size).max(1));
        let capacity = total_blocks - big_blocks;
        let tuning = Tuning::preset(capacity, base.removable);

        tracing::debug!(
            target: "cachet::core",
            label = %options.label,
            capacity,
            big_blocks,
            block_size,
            removable = base.removable,
            "cache created"
        );

        let now = Instant::now();
        let cache = Self {
            cylinder: base.cylinder_blocks(),
            block_size,
            label: options.label,
            idle_threshold: options.idle_threshold,
            state: Mutex::new(CacheState {
                table: CacheTable::new(capacity, block_size),
                big: vec![0_u8; big_blocks * block_size],
                big_blocks,
                tuning,
                tuned: TunedMask::default(),
                stats: CacheStats::default(),
                dirty: 0,
                last_block: None,
                last_activity: now,
                signature: None,
                ready_changed: false,
                disabled_bypass: None,
                next_sync: now + tuning.sync_interval,
                last_error: None,
                mode: AccessMode::ReadWrite,
            }),
            base,
            dev,
        };

        if cache.base.removable {
            let mut st = cache.state.lock();
            let mut anchor = vec![0_u8; cache.block_size];
            if cache.dev.read_blocks(BlockNumber(0), 1, &mut anchor).is_ok() {
                st.signature = Some(crc32fast::hash(&anchor));
            }
        }

        Ok(cache)
    }

    /// Subordinate device handle.
    pub fn inner(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn capacity_blocks(&self) -> usize {
        self.state.lock().table.capacity()
    }

    /// Number of descriptors currently dirty.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty
    }

    /// Snapshot of the running counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock();
        let mut stats = st.stats.clone();
        stats.dirty_blocks = st.dirty;
        stats.capacity_blocks = st.table.capacity();
        stats
    }

    /// Apply a partial tuning change. `None` fields stay unchanged;
    /// a zero sync interval means "flush immediately, always". Fields
    /// touched here are never re-derived on resize.
    pub fn tune(&self, update: TuningUpdate) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.tuning.apply(update, &mut st.tuned);
        if let Some(sync_interval) = update.sync_interval {
            // A shortened interval takes effect now, not at the old
            // deadline.
            st.next_sync = st.next_sync.min(Instant::now() + sync_interval);
        }
        tracing::debug!(target: "cachet::core", label = %self.label, tuning = ?st.tuning, "tuned");
    }

    /// Flush every dirty block, returning how many were written back.
    pub fn flush(&self) -> Result<usize> {
        let mut st = self.state.lock();
        self.check_media(&mut st)?;
        let n = self.flush_invalidate_locked(
            &mut st,
            BlockRange::everything(),
            true,
            false,
            WriteCategory::Foreground,
        )?;
        st.last_activity = Instant::now();
        Ok(n)
    }

    /// Flush and drop everything, then rebuild the table for a new
    /// memory budget, re-deriving every tunable that was never
    /// hand-tuned.
    pub fn resize(&self, memory_bytes: usize) -> Result<()> {
        let mut st = self.state.lock();
        self.flush_invalidate_locked(
            &mut st,
            BlockRange::everything(),
            true,
            true,
            WriteCategory::Foreground,
        )?;

        let total_blocks = memory_bytes / self.block_size;
        if total_blocks < 8 {
            return Err(CachetError::ResourceExhausted(format!(
                "memory budget {memory_bytes} holds fewer than 8 blocks"
            )));
        }
        let big_blocks = (total_blocks / 8)
            .clamp(1, (BIG_BUFFER_CAP_BYTES / self.block_size).max(1));
        let capacity = total_blocks - big_blocks;

        st.table = CacheTable::new(capacity, self.block_size);
        st.big = vec![0_u8; big_blocks * self.block_size];
        st.big_blocks = big_blocks;
        st.dirty = 0;
        st.last_block = None;
        let tuned = st.tuned;
        st.tuning.represet(capacity, self.base.removable, tuned);
        st.next_sync = Instant::now() + st.tuning.sync_interval;
        tracing::debug!(target: "cachet::core", label = %self.label, capacity, "cache resized");
        Ok(())
    }

    /// Take the cache out of the data path: flush and drop everything,
    /// then zero the bypass threshold so every transfer goes straight
    /// to the subordinate. Errors with `AlreadyInState` when already
    /// disabled.
    pub fn disable(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.disabled_bypass.is_some() {
            return Err(CachetError::AlreadyInState("disabled"));
        }
        self.flush_invalidate_locked(
            &mut st,
            BlockRange::everything(),
            true,
            true,
            WriteCategory::Foreground,
        )?;
        st.disabled_bypass = Some(st.tuning.bypass_blocks);
        st.tuning.bypass_blocks = 0;
        tracing::debug!(target: "cachet::core", label = %self.label, "cache disabled");
        Ok(())
    }

    /// Restore the bypass threshold saved by [`Self::disable`]. Errors
    /// with `AlreadyInState` when not disabled.
    pub fn enable(&self) -> Result<()> {
        let mut st = self.state.lock();
        match st.disabled_bypass.take() {
            Some(saved) => {
                st.tuning.bypass_blocks = saved;
                tracing::debug!(target: "cachet::core", label = %self.label, "cache enabled");
                Ok(())
            }
            None => Err(CachetError::AlreadyInState("enabled")),
        }
    }

    // ── media monitor ───────────────────────────────────────────────

    /// Fail fast once a media change is known; after an idle period,
    /// re-verify the anchor block of removable media by checksum. The
    /// subordinate driver's own reporting is honored but not relied on.
    fn check_media(&self, st: &mut CacheState) -> Result<()> {
        if st.ready_changed || self.dev.ready_changed() {
            st.ready_changed = true;
            return Err(CachetError::MediaNotPresent);
        }
        if !self.base.removable || st.last_activity.elapsed() < self.idle_threshold {
            return Ok(());
        }

        let mut anchor = vec![0_u8; self.block_size];
        if self.dev.read_blocks(BlockNumber(0), 1, &mut anchor).is_err() {
            st.ready_changed = true;
            tracing::warn!(target: "cachet::core", label = %self.label, "anchor block unreadable, assuming media change");
            return Err(CachetError::MediaNotPresent);
        }
        let sig = crc32fast::hash(&anchor);
        match st.signature {
            None => {
                st.signature = Some(sig);
                Ok(())
            }
            Some(known) if known == sig => Ok(()),
            Some(_) => {
                st.signature = Some(sig);
                st.ready_changed = true;
                tracing::warn!(target: "cachet::core", label = %self.label, "anchor signature changed, media swapped");
                Err(CachetError::MediaNotPresent)
            }
        }
    }

    /// Classify a subordinate failure. A pending media change always
    /// supersedes the block-specific error.
    fn classify(&self, st: &mut CacheState, block: u64, err: CachetError) -> CachetError {
        if self.dev.ready_changed() || matches!(err, CachetError::MediaNotPresent) {
            st.ready_changed = true;
            return CachetError::MediaNotPresent;
        }
        let err = match err {
            CachetError::Io(io) => CachetError::device(block, io.to_string()),
            other => other,
        };
        if let CachetError::Device { block, detail } = &err {
            st.last_error = Some((*block, detail.clone()));
        }
        err
    }

    // ── allocation and the read path ────────────────────────────────

    fn is_bypass(&self, st: &CacheState, count: u32) -> bool {
        st.tuning.bypass_blocks == 0 || count >= st.tuning.bypass_blocks
    }

    /// Free a slot for a new block: take an empty one, evict the
    /// least-recent clean block, or force a flush pass and retry.
    fn allocate_slot(&self, st: &mut CacheState) -> Result<usize> {
        for attempt in 0..EVICTION_RETRIES {
            if let Some(slot) = st.table.pop_free() {
                return Ok(slot);
            }
            if let Some(slot) = st.table.evict_candidate() {
                let block = st.table.detach(slot);
                tracing::trace!(target: "cachet::core", block, "evicted clean block");
                return Ok(slot);
            }
            tracing::debug!(target: "cachet::core", attempt, dirty = st.dirty, "no clean slot, forcing flush");
            self.flush_invalidate_locked(
                st,
                BlockRange::everything(),
                true,
                false,
                WriteCategory::Forced,
            )?;
        }
        Err(CachetError::ResourceExhausted(
            "no cache slot could be freed after bounded flush retries".to_owned(),
        ))
    }

    /// Read-ahead run length for a miss at `block`: bounded by the big
    /// buffer, the tuned count, half the non-dirty capacity, and the
    /// end of the device. Always at least 1.
    fn read_ahead_len(&self, st: &CacheState, block: u64) -> usize {
        let not_dirty = st.table.capacity().saturating_sub(st.dirty);
        let to_end = usize::try_from(self.base.block_count.saturating_sub(block))
            .unwrap_or(usize::MAX);
        st.big_blocks
            .min((st.tuning.read_ahead as usize).max(1))
            .min((not_dirty / 2).max(1))
            .min(to_end)
            .max(1)
    }

    fn count_hit(&self, st: &mut CacheState) {
        if st.table.hashing() {
            st.stats.hash_hits += 1;
        } else {
            st.stats.recency_hits += 1;
        }
    }

    fn count_miss(&self, st: &mut CacheState) {
        if st.table.hashing() {
            st.stats.hash_misses += 1;
        } else {
            st.stats.recency_misses += 1;
        }
    }

    /// Resolve `block` to a slot with valid content, filling from the
    /// subordinate (with read-ahead) on a miss.
    fn slot_for_read(&self, st: &mut CacheState, block: u64) -> Result<usize> {
        if let Some(slot) = st.table.locate(block) {
            self.count_hit(st);
            st.table.touch(slot);
            st.last_block = Some(block);
            return Ok(slot);
        }
        self.count_miss(st);
        self.hidden_write_check(st, block)?;

        let slot = self.allocate_slot(st)?;
        let n = self.read_ahead_len(st, block);
        let bs = self.block_size;

        if n <= 1 {
            let d = st.table.desc_mut(slot);
            d.block = block;
            d.state = BlockState::Unstable;
            if let Err(err) = self
                .dev
                .read_blocks(BlockNumber(block), 1, st.table.data_mut(slot))
            {
                st.table.release(slot);
                return Err(self.classify(st, block, err));
            }
            st.table.desc_mut(slot).state = BlockState::Clean;
            st.table.insert_index(block, slot);
            st.table.push_mru(slot);
            st.last_block = Some(block);
            return Ok(slot);
        }

        let count = u32::try_from(n).unwrap_or(u32::MAX);
        // Claim the slot for the target block before touching the
        // subordinate: `release` on the error path unindexes the slot's
        // block field, which must not be whatever the slot held last.
        let d = st.table.desc_mut(slot);
        d.block = block;
        d.state = BlockState::Unstable;
        if let Err(err) = self
            .dev
            .read_blocks(BlockNumber(block), count, &mut st.big[..n * bs])
        {
            st.table.release(slot);
            return Err(self.classify(st, block, err));
        }

        // Distribute the run into slots, stopping early if a target is
        // already indexed or no slot can be had without flushing.
        let mut extra = 0_u64;
        for k in 0..n {
            let b = block + k as u64;
            let s = if k == 0 {
                slot
            } else {
                if st.table.locate(b).is_some() {
                    break;
                }
                let reclaimed = st.table.pop_free().or_else(|| {
                    st.table.evict_candidate().map(|victim| {
                        st.table.detach(victim);
                        victim
                    })
                });
                match reclaimed {
                    Some(s) => s,
                    None => break,
                }
            };
            let d = st.table.desc_mut(s);
            d.block = b;
            d.state = BlockState::Unstable;
            st.table.data_mut(s).copy_from_slice(&st.big[k * bs..(k + 1) * bs]);
            st.table.desc_mut(s).state = BlockState::Clean;
            st.table.insert_index(b, s);
            st.table.push_mru(s);
            if k > 0 {
                extra += 1;
            }
        }
        st.stats.read_aheads += extra;
        st.last_block = Some(block);
        Ok(slot)
    }

    /// Resolve `block` to a slot for a whole-block overwrite: no
    /// subordinate read on a miss, the caller supplies every byte.
    fn slot_for_overwrite(&self, st: &mut CacheState, block: u64) -> Result<(usize, bool)> {
        if let Some(slot) = st.table.locate(block) {
            self.count_hit(st);
            st.table.touch(slot);
            let was_dirty = st.table.desc(slot).state == BlockState::Dirty;
            return Ok((slot, was_dirty));
        }
        self.count_miss(st);
        let slot = self.allocate_slot(st)?;
        let d = st.table.desc_mut(slot);
        d.block = block;
        d.state = BlockState::Unstable;
        st.table.insert_index(block, slot);
        st.table.push_mru(slot);
        Ok((slot, false))
    }

    /// Store one whole block of caller data and mark it dirty.
    fn write_one_block(&self, st: &mut CacheState, block: u64, bytes: &[u8]) -> Result<()> {
        let (slot, was_dirty) = self.slot_for_overwrite(st, block)?;
        st.table.desc_mut(slot).state = BlockState::Unstable;
        st.table.data_mut(slot).copy_from_slice(bytes);
        st.table.desc_mut(slot).state = BlockState::Dirty;
        if !was_dirty {
            st.dirty += 1;
        }
        st.last_block = Some(block);
        Ok(())
    }

    /// Enforce the dirty ceiling after a write call.
    fn enforce_dirty_ceiling(&self, st: &mut CacheState) -> Result<()> {
        if st.dirty > st.tuning.dirty_max {
            tracing::debug!(
                target: "cachet::core",
                dirty = st.dirty,
                ceiling = st.tuning.dirty_max,
                "dirty ceiling exceeded, flushing"
            );
            self.flush_invalidate_locked(
                st,
                BlockRange::everything(),
                true,
                false,
                WriteCategory::Forced,
            )?;
        }
        Ok(())
    }

    /// A forward seek past the skipped range must not leave unflushed
    /// data behind it: flush dirty blocks between the last touched
    /// block and the target when the jump exceeds one cylinder.
    fn hidden_write_check(&self, st: &mut CacheState, target: u64) -> Result<()> {
        let Some(last) = st.last_block else {
            return Ok(());
        };
        if target <= last || target - last <= self.cylinder || st.dirty == 0 {
            return Ok(());
        }
        tracing::debug!(
            target: "cachet::core",
            from = last + 1,
            to = target,
            "flushing skipped range before forward seek"
        );
        self.flush_invalidate_locked(
            st,
            BlockRange::new(last + 1, target),
            true,
            false,
            WriteCategory::Hidden,
        )?;
        Ok(())
    }

    // ── flush / invalidate engine ───────────────────────────────────

    /// Walk the index for `range`, batch dirty blocks into contiguous
    /// runs, write them out, and optionally drop cache entries.
    ///
    /// A batch that fails to write is force-invalidated regardless of
    /// `do_invalidate`: after a write error the cached copy's relation
    /// to the medium is unknown, and losing the update beats serving
    /// data believed clean. The first error is reported after the
    /// whole walk completes.
    fn flush_invalidate_locked(
        &self,
        st: &mut CacheState,
        range: BlockRange,
        do_flush: bool,
        do_invalidate: bool,
        category: WriteCategory,
    ) -> Result<usize> {
        let bs = self.block_size;
        let mut pending: Vec<usize> = Vec::new();
        let mut processed = 0_usize;

        let slots: Vec<usize> = st.table.iter_lru().collect();
        for slot in slots {
            let d = st.table.desc(slot);
            if !range.contains(BlockNumber(d.block)) {
                continue;
            }
            match d.state {
                BlockState::Dirty if do_flush => {
                    // Staged for the sorted batch walk: off the recency
                    // list but still indexed, so concurrent-looking
                    // lookups within this lock hold still find it.
                    st.table.unlink(slot);
                    pending.push(slot);
                }
                BlockState::Dirty if do_invalidate => {
                    st.table.release(slot);
                    st.dirty -= 1;
                    processed += 1;
                }
                BlockState::Clean if do_invalidate => {
                    st.table.release(slot);
                    processed += 1;
                }
                BlockState::Empty => debug_assert!(false, "empty slot on recency list"),
                BlockState::Clean | BlockState::Dirty => {}
                BlockState::Unstable => {
                    // Unstable never escapes the critical section that
                    // created it, so a flush walk cannot see one.
                    debug_assert!(false, "unstable slot during flush walk");
                }
            }
        }

        pending.sort_by_key(|&slot| st.table.desc(slot).block);

        let mut first_err: Option<CachetError> = None;
        let mut i = 0;
        while i < pending.len() {
            // Maximal contiguous run, capped at the big buffer.
            let mut j = i + 1;
            while j < pending.len()
                && j - i < st.big_blocks
                && st.table.desc(pending[j]).block == st.table.desc(pending[j - 1]).block + 1
            {
                j += 1;
            }
            let run = &pending[i..j];
            let run_start = st.table.desc(run[0]).block;
            let run_len = run.len();

            let written = if run_len == 1 {
                self.dev
                    .write_blocks(BlockNumber(run_start), 1, st.table.data(run[0]))
            } else {
                for (k, &slot) in run.iter().enumerate() {
                    st.big[k * bs..(k + 1) * bs].copy_from_slice(st.table.data(slot));
                }
                let count = u32::try_from(run_len).unwrap_or(u32::MAX);
                self.dev
                    .write_blocks(BlockNumber(run_start), count, &st.big[..run_len * bs])
            };

            match written {
                Ok(()) => {
                    for &slot in run {
                        st.dirty -= 1;
                        processed += 1;
                        if do_invalidate {
                            st.table.release(slot);
                        } else {
                            st.table.desc_mut(slot).state = BlockState::Clean;
                            st.table.push_mru(slot);
                        }
                    }
                    let count = run_len as u64;
                    match category {
                        WriteCategory::Foreground => st.stats.writes_foreground += count,
                        WriteCategory::Background => st.stats.writes_background += count,
                        WriteCategory::Hidden => st.stats.writes_hidden += count,
                        WriteCategory::Forced => st.stats.writes_forced += count,
                    }
                    tracing::trace!(
                        target: "cachet::core",
                        start = run_start,
                        len = run_len,
                        "flushed run"
                    );
                }
                Err(err) => {
                    // Coherency after a write error is not assumed:
                    // drop the whole batch so later reads re-fetch.
                    for &slot in run {
                        st.dirty -= 1;
                        processed += 1;
                        st.table.release(slot);
                    }
                    tracing::warn!(
                        target: "cachet::core",
                        start = run_start,
                        len = run_len,
                        error = %err,
                        "flush batch failed, invalidating"
                    );
                    let classified = self.classify(st, run_start, err);
                    first_err.get_or_insert(classified);
                }
            }
            i = j;
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(processed),
        }
    }

    /// Drop every cache entry without writing anything back.
    fn invalidate_all_locked(&self, st: &mut CacheState) {
        let slots: Vec<usize> = st.table.iter_lru().collect();
        for slot in slots {
            if st.table.desc(slot).state == BlockState::Dirty {
                st.dirty -= 1;
            }
            st.table.release(slot);
        }
        debug_assert_eq!(st.dirty, 0);
        st.dirty = 0;
    }

    // ── bypass path ─────────────────────────────────────────────────

    fn bypass_read(
        &self,
        st: &mut CacheState,
        start: BlockNumber,
        count: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        self.hidden_write_check(st, start.0)?;
        let range = BlockRange::from_start_count(start, u64::from(count))
            .ok_or_else(|| CachetError::InvalidRequest("block range overflows u64".to_owned()))?;
        // The direct read must see current data: flush dirty overlap.
        self.flush_invalidate_locked(st, range, true, false, WriteCategory::Foreground)?;
        self.dev
            .read_blocks(start, count, buf)
            .map_err(|err| self.classify(st, start.0, err))?;
        st.stats.bypass_reads += 1;
        st.last_block = Some(start.0 + u64::from(count) - 1);
        Ok(())
    }

    fn bypass_write(
        &self,
        st: &mut CacheState,
        start: BlockNumber,
        count: u32,
        buf: &[u8],
    ) -> Result<()> {
        self.hidden_write_check(st, start.0)?;
        let range = BlockRange::from_start_count(start, u64::from(count))
            .ok_or_else(|| CachetError::InvalidRequest("block range overflows u64".to_owned()))?;
        // Stale cached copies must not be served afterwards; dirty
        // overlap is superseded wholesale by the incoming data.
        self.flush_invalidate_locked(st, range, false, true, WriteCategory::Foreground)?;
        self.dev
            .write_blocks(start, count, buf)
            .map_err(|err| self.classify(st, start.0, err))?;
        st.stats.bypass_writes += 1;
        st.last_block = Some(start.0 + u64::from(count) - 1);
        Ok(())
    }
}

impl<D: BlockIo> BlockIo for CacheDevice<D> {
    fn read_blocks(&self, start: BlockNumber, count: u32, buf: &mut [u8]) -> Result<()> {
        check_block_transfer(&self.base, start, count, buf.len())?;
        let mut st = self.state.lock();
        if !st.mode.allows_read() {
            return Err(CachetError::InvalidRequest(
                "device is write-only".to_owned(),
            ));
        }
        self.check_media(&mut st)?;

        let result = if self.is_bypass(&st, count) {
            self.bypass_read(&mut st, start, count, buf)
        } else {
            let bs = self.block_size;
            (0..count as usize).try_for_each(|i| {
                let slot = self.slot_for_read(&mut st, start.0 + i as u64)?;
                buf[i * bs..(i + 1) * bs].copy_from_slice(st.table.data(slot));
                Ok(())
            })
        };
        st.last_activity = Instant::now();
        result
    }

    fn write_blocks(&self, start: BlockNumber, count: u32, buf: &[u8]) -> Result<()> {
        check_block_transfer(&self.base, start, count, buf.len())?;
        let mut st = self.state.lock();
        if !st.mode.allows_write() {
            return Err(CachetError::InvalidRequest("device is read-only".to_owned()));
        }
        self.check_media(&mut st)?;

        let result = if self.is_bypass(&st, count) {
            self.bypass_write(&mut st, start, count, buf)
        } else {
            let bs = self.block_size;
            (0..count as usize)
                .try_for_each(|i| {
                    self.write_one_block(&mut st, start.0 + i as u64, &buf[i * bs..(i + 1) * bs])
                })
                .and_then(|()| self.enforce_dirty_ceiling(&mut st))
        };
        st.last_activity = Instant::now();
        result
    }

    fn read_bytes(&self, block: BlockNumber, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.read_bytes_cookie(block, offset, buf, None)
    }

    fn write_bytes(&self, block: BlockNumber, offset: u32, buf: &[u8]) -> Result<()> {
        self.write_bytes_cookie(block, offset, buf, None)
    }

    fn read_bytes_cookie(
        &self,
        block: BlockNumber,
        offset: u32,
        buf: &mut [u8],
        mut cookie: Option<&mut BlockCookie>,
    ) -> Result<()> {
        check_byte_access(&self.base, block, offset, buf.len())?;
        let mut st = self.state.lock();
        if !st.mode.allows_read() {
            return Err(CachetError::InvalidRequest(
                "device is write-only".to_owned(),
            ));
        }
        self.check_media(&mut st)?;

        if st.disabled_bypass.is_some() {
            let result = self.dev.read_bytes(block, offset, buf);
            st.last_activity = Instant::now();
            return result.map_err(|err| self.classify(&mut st, block.0, err));
        }

        let slot = match self.cookie_slot(&mut st, block, cookie.as_deref()) {
            Some(slot) => slot,
            None => self.slot_for_read(&mut st, block.0)?,
        };
        let lo = offset as usize;
        buf.copy_from_slice(&st.table.data(slot)[lo..lo + buf.len()]);
        if let Some(c) = cookie.as_mut() {
            **c = BlockCookie {
                block,
                slot: slot as u64,
            };
        }
        st.last_activity = Instant::now();
        Ok(())
    }

    fn write_bytes_cookie(
        &self,
        block: BlockNumber,
        offset: u32,
        buf: &[u8],
        mut cookie: Option<&mut BlockCookie>,
    ) -> Result<()> {
        check_byte_access(&self.base, block, offset, buf.len())?;
        let mut st = self.state.lock();
        if !st.mode.allows_write() {
            return Err(CachetError::InvalidRequest("device is read-only".to_owned()));
        }
        self.check_media(&mut st)?;

        if st.disabled_bypass.is_some() {
            let result = self.dev.write_bytes(block, offset, buf);
            st.last_activity = Instant::now();
            return result.map_err(|err| self.classify(&mut st, block.0, err));
        }

        // Sub-block update is read-modify-write: a miss fills the block
        // from the subordinate first.
        let slot = match self.cookie_slot(&mut st, block, cookie.as_deref()) {
            Some(slot) => slot,
            None => self.slot_for_read(&mut st, block.0)?,
        };
        let was_dirty = st.table.desc(slot).state == BlockState::Dirty;
        st.table.desc_mut(slot).state = BlockState::Unstable;
        let lo = offset as usize;
        st.table.data_mut(slot)[lo..lo + buf.len()].copy_from_slice(buf);
        st.table.desc_mut(slot).state = BlockState::Dirty;
        if !was_dirty {
            st.dirty += 1;
        }
        if let Some(c) = cookie.as_mut() {
            **c = BlockCookie {
                block,
                slot: slot as u64,
            };
        }
        self.enforce_dirty_ceiling(&mut st)?;
        st.last_activity = Instant::now();
        Ok(())
    }

    fn copy_blocks(&self, src: BlockNumber, dst: BlockNumber, count: u32) -> Result<()> {
        let len = u64::from(count) * self.block_size as u64;
        let len = usize::try_from(len)
            .map_err(|_| CachetError::InvalidRequest("copy length does not fit usize".to_owned()))?;
        check_block_transfer(&self.base, src, count, len)?;
        check_block_transfer(&self.base, dst, count, len)?;
        let mut st = self.state.lock();
        if !st.mode.allows_write() {
            return Err(CachetError::InvalidRequest("device is read-only".to_owned()));
        }
        self.check_media(&mut st)?;

        let result = if self.is_bypass(&st, count) {
            let src_range = BlockRange::from_start_count(src, u64::from(count))
                .ok_or_else(|| CachetError::InvalidRequest("block range overflows".to_owned()))?;
            let dst_range = BlockRange::from_start_count(dst, u64::from(count))
                .ok_or_else(|| CachetError::InvalidRequest("block range overflows".to_owned()))?;
            self.flush_invalidate_locked(&mut st, src_range, true, false, WriteCategory::Foreground)
                .and_then(|_| {
                    self.flush_invalidate_locked(
                        &mut st,
                        dst_range,
                        false,
                        true,
                        WriteCategory::Foreground,
                    )
                })
                .and_then(|_| {
                    self.dev
                        .copy_blocks(src, dst, count)
                        .map_err(|err| self.classify(&mut st, src.0, err))
                })
        } else {
            let mut scratch = vec![0_u8; self.block_size];
            (0..u64::from(count))
                .try_for_each(|i| {
                    let slot = self.slot_for_read(&mut st, src.0 + i)?;
                    scratch.copy_from_slice(st.table.data(slot));
                    self.write_one_block(&mut st, dst.0 + i, &scratch)
                })
                .and_then(|()| self.enforce_dirty_ceiling(&mut st))
        };
        st.last_activity = Instant::now();
        result
    }

    fn control(&self, cmd: ControlCommand) -> Result<()> {
        match cmd {
            ControlCommand::Reset => {
                let mut st = self.state.lock();
                self.invalidate_all_locked(&mut st);
                st.ready_changed = false;
                st.signature = None;
                st.last_error = None;
                st.last_block = None;
                st.last_activity = Instant::now();
                tracing::debug!(target: "cachet::core", label = %self.label, "reset");
                self.dev.control(ControlCommand::Reset)
            }
            ControlCommand::StatusCheck => {
                let mut st = self.state.lock();
                if st.ready_changed || self.dev.ready_changed() {
                    st.ready_changed = true;
                    return Err(CachetError::MediaNotPresent);
                }
                self.dev.control(ControlCommand::StatusCheck).map_err(|err| {
                    self.classify(&mut st, 0, err)
                })
            }
            ControlCommand::Eject => {
                let mut st = self.state.lock();
                self.flush_invalidate_locked(
                    &mut st,
                    BlockRange::everything(),
                    true,
                    true,
                    WriteCategory::Foreground,
                )?;
                self.dev.control(ControlCommand::Eject)
            }
            ControlCommand::Flush(FlushWhen::Now) => {
                let mut st = self.state.lock();
                self.check_media(&mut st)?;
                self.flush_invalidate_locked(
                    &mut st,
                    BlockRange::everything(),
                    true,
                    false,
                    WriteCategory::Foreground,
                )?;
                st.last_activity = Instant::now();
                Ok(())
            }
            ControlCommand::Flush(FlushWhen::Within(delay)) => {
                let mut st = self.state.lock();
                let deadline = Instant::now() + delay;
                st.next_sync = st.next_sync.min(deadline);
                Ok(())
            }
            ControlCommand::Flush(FlushWhen::Opportunistic) => {
                let mut st = self.state.lock();
                if st.dirty > 0 {
                    self.flush_invalidate_locked(
                        &mut st,
                        BlockRange::everything(),
                        true,
                        false,
                        WriteCategory::Foreground,
                    )?;
                    st.last_activity = Instant::now();
                }
                Ok(())
            }
            ControlCommand::InvalidateAll => {
                let mut st = self.state.lock();
                self.invalidate_all_locked(&mut st);
                Ok(())
            }
            ControlCommand::AllocScratch(block) => {
                if block.0 >= self.base.block_count {
                    return Err(CachetError::InvalidRequest(format!(
                        "scratch block {} out of range",
                        block.0
                    )));
                }
                let mut st = self.state.lock();
                if st.disabled_bypass.is_some() {
                    return self.dev.control(cmd);
                }
                self.check_media(&mut st)?;
                // Zero-filled and dirty: the medium has stale content
                // there until the scratch block is flushed.
                let (slot, was_dirty) = self.slot_for_overwrite(&mut st, block.0)?;
                st.table.desc_mut(slot).state = BlockState::Unstable;
                st.table.data_mut(slot).fill(0);
                st.table.desc_mut(slot).state = BlockState::Dirty;
                if !was_dirty {
                    st.dirty += 1;
                }
                self.enforce_dirty_ceiling(&mut st)?;
                st.last_activity = Instant::now();
                Ok(())
            }
            ControlCommand::LockMedia | ControlCommand::UnlockMedia => self.dev.control(cmd),
        }
    }

    fn params(&self) -> DeviceParams {
        let mut params = self.dev.params();
        let st = self.state.lock();
        if let Some((block, detail)) = &st.last_error {
            params.last_error_block = Some(*block);
            params.last_error = Some(detail.clone());
        }
        params
    }

    fn mode(&self) -> AccessMode {
        self.state.lock().mode
    }

    fn set_mode(&self, mode: AccessMode) -> Result<()> {
        self.state.lock().mode = mode;
        Ok(())
    }

    fn ready_changed(&self) -> bool {
        self.state.lock().ready_changed || self.dev.ready_changed()
    }

    fn set_ready_changed(&self, changed: bool) {
        self.state.lock().ready_changed = changed;
    }
}

impl<D: BlockIo> CacheDevice<D> {
    /// Validate a replayed cookie: it must still name the same block in
    /// a servable state. A valid cookie counts as a hit on whichever
    /// index the table runs.
    fn cookie_slot(
        &self,
        st: &mut CacheState,
        block: BlockNumber,
        cookie: Option<&BlockCookie>,
    ) -> Option<usize> {
        let c = cookie?;
        if c.block != block {
            return None;
        }
        let slot = usize::try_from(c.slot).ok()?;
        if slot >= st.table.capacity() {
            return None;
        }
        let d = st.table.desc(slot);
        if d.block != block.0 || !matches!(d.state, BlockState::Clean | BlockState::Dirty) {
            return None;
        }
        self.count_hit(st);
        st.table.touch(slot);
        st.last_block = Some(block.0);
        Some(slot)
    }
}

impl<D: BlockIo> BackgroundSweep for CacheDevice<D> {
    /// One background pass, skipped entirely when a foreground caller
    /// holds the lock. Past the sync deadline, dirty blocks are written
    /// back; an idle removable instance with nothing dirty gets its
    /// clean blocks dropped instead, so a quiet media swap cannot serve
    /// stale data later.
    fn try_sweep(&self, now: Instant) -> bool {
        let Some(mut st) = self.state.try_lock() else {
            return false;
        };
        if now < st.next_sync {
            return true;
        }
        if st.dirty > 0 {
            if let Err(err) = self.flush_invalidate_locked(
                &mut st,
                BlockRange::everything(),
                true,
                false,
                WriteCategory::Background,
            ) {
                tracing::warn!(
                    target: "cachet::daemon",
                    label = %self.label,
                    error = %err,
                    "background flush failed"
                );
            }
        } else if self.base.removable
            && st.table.occupied() > 0
            && now.duration_since(st.last_activity) >= self.idle_threshold
        {
            self.invalidate_all_locked(&mut st);
        }
        st.next_sync = now + st.tuning.sync_interval;
        true
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl<D: BlockIo> std::fmt::Debug for CacheDevice<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("CacheDevice")
            .field("label", &self.label)
            .field("capacity", &st.table.capacity())
            .field("dirty", &st.dirty)
            .field("disabled", &st.disabled_bypass.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_device::RamDisk;

    fn cache_over_ram(device_blocks: u64, memory_blocks: usize) -> CacheDevice<RamDisk> {
        let ram = RamDisk::new(device_blocks, 512);
        CacheDevice::new(ram, CacheOptions::new(memory_blocks * 512)).unwrap()
    }

    #[test]
    fn rejects_tiny_memory_budget() {
        let ram = RamDisk::new(16, 512);
        assert!(matches!(
            CacheDevice::new(ram, CacheOptions::new(512)),
            Err(CachetError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn miss_reads_ahead_into_neighbors() {
        // 32 memory blocks: 4 go to the big buffer, 28 to slots.
        let cache = cache_over_ram(64, 32);
        let mut buf = [0_u8; 512];
        cache.read_blocks(BlockNumber(0), 1, &mut buf).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.recency_misses, 1);
        assert_eq!(stats.read_aheads, 3);

        // The read-ahead neighbors are hits now.
        for block in 1..4 {
            cache.read_blocks(BlockNumber(block), 1, &mut buf).unwrap();
        }
        assert_eq!(cache.stats().recency_hits, 3);
    }

    #[test]
    fn read_ahead_stops_at_device_end() {
        let cache = cache_over_ram(10, 32);
        let mut buf = [0_u8; 512];
        cache.read_blocks(BlockNumber(9), 1, &mut buf).unwrap();
        assert_eq!(cache.stats().read_aheads, 0);
    }

    #[test]
    fn dirty_counter_never_double_counts() {
        let cache = cache_over_ram(16, 32);
        cache.write_blocks(BlockNumber(3), 1, &[1_u8; 512]).unwrap();
        cache.write_blocks(BlockNumber(3), 1, &[2_u8; 512]).unwrap();
        assert_eq!(cache.dirty_count(), 1);

        let mut buf = [0_u8; 512];
        cache.read_blocks(BlockNumber(3), 1, &mut buf).unwrap();
        assert_eq!(buf, [2_u8; 512]);
    }

    #[test]
    fn ceiling_breach_triggers_forced_flush() {
        let cache = cache_over_ram(16, 32);
        cache.tune(TuningUpdate {
            dirty_max: Some(2),
            ..TuningUpdate::default()
        });

        cache.write_blocks(BlockNumber(1), 1, &[0x11_u8; 512]).unwrap();
        cache.write_blocks(BlockNumber(2), 1, &[0x22_u8; 512]).unwrap();
        assert_eq!(cache.dirty_count(), 2);

        cache.write_blocks(BlockNumber(3), 1, &[0x33_u8; 512]).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.stats().writes_forced, 3);
        assert_eq!(cache.inner().snapshot_block(BlockNumber(1)), vec![0x11_u8; 512]);
        assert_eq!(cache.inner().snapshot_block(BlockNumber(3)), vec![0x33_u8; 512]);
    }

    #[test]
    fn forward_seek_flushes_skipped_dirty_blocks() {
        // Unreported geometry falls back to a 64-block cylinder.
        let cache = cache_over_ram(256, 32);
        cache.write_blocks(BlockNumber(50), 1, &[0x77_u8; 512]).unwrap();

        let mut buf = [0_u8; 512];
        // Move the access point below the dirty block without flushing.
        cache.read_blocks(BlockNumber(5), 1, &mut buf).unwrap();
        assert_eq!(cache.dirty_count(), 1);

        // A jump of more than a cylinder flushes what it skips over.
        cache.read_blocks(BlockNumber(200), 1, &mut buf).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.stats().writes_hidden, 1);
        assert_eq!(cache.inner().snapshot_block(BlockNumber(50)), vec![0x77_u8; 512]);
    }

    #[test]
    fn short_forward_seek_leaves_dirty_alone() {
        let cache = cache_over_ram(256, 32);
        cache.write_blocks(BlockNumber(10), 1, &[0x55_u8; 512]).unwrap();

        let mut buf = [0_u8; 512];
        cache.read_blocks(BlockNumber(40), 1, &mut buf).unwrap();
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.stats().writes_hidden, 0);
    }

    #[test]
    fn flush_returns_written_count() {
        let cache = cache_over_ram(16, 32);
        for block in [2_u64, 5, 9] {
            cache.write_blocks(BlockNumber(block), 1, &[0xAB_u8; 512]).unwrap();
        }
        assert_eq!(cache.flush().unwrap(), 3);
        assert_eq!(cache.flush().unwrap(), 0);
        assert_eq!(cache.stats().writes_foreground, 3);
    }

    #[test]
    fn disable_routes_traffic_directly() {
        let cache = cache_over_ram(16, 32);
        cache.write_blocks(BlockNumber(1), 1, &[0xC1_u8; 512]).unwrap();
        assert_eq!(cache.inner().snapshot_block(BlockNumber(1)), vec![0_u8; 512]);

        cache.disable().unwrap();
        // The disable itself flushed the pending block.
        assert_eq!(cache.inner().snapshot_block(BlockNumber(1)), vec![0xC1_u8; 512]);
        assert!(matches!(cache.disable(), Err(CachetError::AlreadyInState(_))));

        // Disabled writes land on the medium immediately.
        cache.write_blocks(BlockNumber(2), 1, &[0xC2_u8; 512]).unwrap();
        assert_eq!(cache.inner().snapshot_block(BlockNumber(2)), vec![0xC2_u8; 512]);
        assert_eq!(cache.dirty_count(), 0);

        cache.enable().unwrap();
        assert!(matches!(cache.enable(), Err(CachetError::AlreadyInState(_))));
        cache.write_blocks(BlockNumber(3), 1, &[0xC3_u8; 512]).unwrap();
        assert_eq!(cache.dirty_count(), 1);
    }

    #[test]
    fn resize_flushes_and_rederives() {
        let cache = cache_over_ram(64, 32);
        cache.write_blocks(BlockNumber(4), 1, &[0x99_u8; 512]).unwrap();

        cache.resize(64 * 512).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.inner().snapshot_block(BlockNumber(4)), vec![0x99_u8; 512]);
        assert!(cache.capacity_blocks() > 32);
    }

    #[test]
    fn alloc_scratch_materializes_zeroed_dirty_block() {
        let cache = cache_over_ram(16, 32);
        cache
            .inner()
            .write_blocks(BlockNumber(6), 1, &[0xFF_u8; 512])
            .unwrap();

        cache
            .control(ControlCommand::AllocScratch(BlockNumber(6)))
            .unwrap();
        assert_eq!(cache.dirty_count(), 1);

        // The scratch block reads back zeroed without touching the
        // medium's stale content until a flush.
        let mut buf = [0xEE_u8; 512];
        cache.read_blocks(BlockNumber(6), 1, &mut buf).unwrap();
        assert_eq!(buf, [0_u8; 512]);
        assert_eq!(cache.inner().snapshot_block(BlockNumber(6)), vec![0xFF_u8; 512]);

        cache.flush().unwrap();
        assert_eq!(cache.inner().snapshot_block(BlockNumber(6)), vec![0_u8; 512]);
    }

    #[test]
    fn stats_report_dirty_fraction() {
        let cache = cache_over_ram(16, 32);
        cache.write_blocks(BlockNumber(0), 1, &[1_u8; 512]).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.dirty_blocks, 1);
        assert!(stats.dirty_fraction() > 0.0);
        assert!(stats.dirty_fraction() < 1.0);
    }
}
