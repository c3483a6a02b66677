//! Background flush task and the registry it sweeps.
//!
//! One [`FlushDaemon`] thread serves every cache instance in a
//! [`CacheRegistry`]. Each tick it walks the registry and offers each
//! live instance a sweep; instances whose lock is held by a foreground
//! caller are skipped, never waited on, so background work cannot delay
//! the data path.

use cachet_error::{CachetError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A cache instance's view of the background task.
pub trait BackgroundSweep: Send + Sync {
    /// Attempt one maintenance pass. Returns `false` when the instance
    /// was busy and nothing was attempted.
    fn try_sweep(&self, now: Instant) -> bool;

    /// Diagnostic label.
    fn label(&self) -> &str;
}

/// What one registry sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances that accepted a pass.
    pub swept: usize,
    /// Instances skipped because their lock was held.
    pub skipped: usize,
    /// Dead registrations dropped.
    pub pruned: usize,
}

/// Bounded registry of cache instances for the flush daemon.
///
/// Holds weak handles only, so a registered instance can be dropped
/// without deregistering; the stale slot is pruned on the next sweep.
pub struct CacheRegistry {
    slots: Mutex<Vec<Weak<dyn BackgroundSweep>>>,
    capacity: usize,
}

impl CacheRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Add an instance. Dead slots are reclaimed first; a full registry
    /// errors with `ResourceExhausted`.
    pub fn register(&self, instance: Weak<dyn BackgroundSweep>) -> Result<()> {
        let mut slots = self.slots.lock();
        slots.retain(|slot| slot.strong_count() > 0);
        if slots.len() >= self.capacity {
            return Err(CachetError::ResourceExhausted(format!(
                "registry is full ({} instances)",
                self.capacity
            )));
        }
        slots.push(instance);
        Ok(())
    }

    /// Remove an instance. Unknown handles are ignored.
    pub fn deregister(&self, instance: &Weak<dyn BackgroundSweep>) {
        let mut slots = self.slots.lock();
        slots.retain(|slot| !slot.ptr_eq(instance));
    }

    /// [`Self::register`] for a concrete shared instance.
    pub fn register_instance<S: BackgroundSweep + 'static>(&self, instance: &Arc<S>) -> Result<()> {
        let shared: Arc<dyn BackgroundSweep> = instance.clone();
        self.register(Arc::downgrade(&shared))
    }

    /// [`Self::deregister`] for a concrete shared instance.
    pub fn deregister_instance<S: BackgroundSweep + 'static>(&self, instance: &Arc<S>) {
        let shared: Arc<dyn BackgroundSweep> = instance.clone();
        self.deregister(&Arc::downgrade(&shared));
    }

    /// Live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer every live instance one maintenance pass.
    ///
    /// Instances are upgraded and collected before any sweep runs, so
    /// registration never contends with instance I/O.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let instances: Vec<Arc<dyn BackgroundSweep>> = {
            let mut slots = self.slots.lock();
            let before = slots.len();
            slots.retain(|slot| slot.strong_count() > 0);
            report.pruned = before - slots.len();
            slots.iter().filter_map(Weak::upgrade).collect()
        };
        for instance in instances {
            if instance.try_sweep(now) {
                report.swept += 1;
            } else {
                tracing::trace!(
                    target: "cachet::daemon",
                    label = instance.label(),
                    "instance busy, skipped"
                );
                report.skipped += 1;
            }
        }
        report
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("capacity", &self.capacity)
            .field("live", &self.len())
            .finish()
    }
}

/// Flush daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct FlushDaemonConfig {
    /// Sweep period.
    pub tick: Duration,
}

impl Default for FlushDaemonConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
        }
    }
}

/// Handle to the background flush thread. Dropping it stops the thread.
pub struct FlushDaemon {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    /// Start the flush thread over `registry`.
    pub fn spawn(registry: Arc<CacheRegistry>, config: FlushDaemonConfig) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("cachet-flush".to_owned())
            .spawn(move || {
                tracing::info!(target: "cachet::daemon", tick_ms = config.tick.as_millis() as u64, "flush daemon started");
                while !thread_stop.load(Ordering::Relaxed) {
                    registry.sweep(Instant::now());
                    std::thread::sleep(config.tick);
                }
                tracing::info!(target: "cachet::daemon", "flush daemon stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for FlushDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushDaemon")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        sweeps: AtomicUsize,
        busy: AtomicBool,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sweeps: AtomicUsize::new(0),
                busy: AtomicBool::new(false),
            })
        }
    }

    impl BackgroundSweep for Probe {
        fn try_sweep(&self, _now: Instant) -> bool {
            if self.busy.load(Ordering::SeqCst) {
                return false;
            }
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn label(&self) -> &str {
            "probe"
        }
    }

    fn downgrade(probe: &Arc<Probe>) -> Weak<dyn BackgroundSweep> {
        let weak = Arc::downgrade(probe);
        let weak: Weak<dyn BackgroundSweep> = weak;
        weak
    }

    #[test]
    fn registry_is_bounded() {
        let registry = CacheRegistry::new(2);
        let a = Probe::new();
        let b = Probe::new();
        let c = Probe::new();

        registry.register(downgrade(&a)).unwrap();
        registry.register(downgrade(&b)).unwrap();
        assert!(matches!(
            registry.register(downgrade(&c)),
            Err(CachetError::ResourceExhausted(_))
        ));

        // A dropped instance frees its slot.
        drop(a);
        registry.register(downgrade(&c)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn sweep_counts_busy_and_pruned() {
        let registry = CacheRegistry::new(4);
        let a = Probe::new();
        let b = Probe::new();
        let dead = Probe::new();

        registry.register(downgrade(&a)).unwrap();
        registry.register(downgrade(&b)).unwrap();
        registry.register(downgrade(&dead)).unwrap();
        drop(dead);

        b.busy.store(true, Ordering::SeqCst);
        let report = registry.sweep(Instant::now());
        assert_eq!(report.swept, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.pruned, 1);
        assert_eq!(a.sweeps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregister_removes_only_the_target() {
        let registry = CacheRegistry::new(4);
        let a = Probe::new();
        let b = Probe::new();
        registry.register(downgrade(&a)).unwrap();
        registry.register(downgrade(&b)).unwrap();

        registry.deregister(&downgrade(&a));
        assert_eq!(registry.len(), 1);

        let report = registry.sweep(Instant::now());
        assert_eq!(report.swept, 1);
        assert_eq!(a.sweeps.load(Ordering::SeqCst), 0);
        assert_eq!(b.sweeps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn daemon_sweeps_until_shutdown() {
        let registry = Arc::new(CacheRegistry::new(4));
        let probe = Probe::new();
        registry.register(downgrade(&probe)).unwrap();

        let daemon = FlushDaemon::spawn(
            Arc::clone(&registry),
            FlushDaemonConfig {
                tick: Duration::from_millis(5),
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.sweeps.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "daemon never swept");
            std::thread::sleep(Duration::from_millis(5));
        }
        daemon.shutdown();

        let after = probe.sweeps.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(probe.sweeps.load(Ordering::SeqCst), after);
    }
}
