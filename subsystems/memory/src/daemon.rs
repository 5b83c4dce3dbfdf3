//! # Kernel Daemons
//!
//! A daemon is a periodic maintenance hook multiplexed onto one shared
//! low-priority thread per pool. The thread sleeps for a fixed tick,
//! increments an iteration counter and invokes every daemon whose
//! `(iteration + offset) % frequency` hits zero. Offsets are assigned at
//! registration to spread daemons of the same frequency across iterations.
//!
//! The pool itself is thread-agnostic: whoever owns the pool's thread calls
//! [`DaemonPool::tick`] once per tick. Due hooks are invoked with the pool
//! unlocked, so a daemon may register or unregister daemons - itself
//! included - from within its own invocation.

use crate::{VmError, VmResult};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, Ordering};
use spin::Mutex;

/// Nominal tick period of a daemon thread, in microseconds
pub const TICK_PERIOD_MICROS: u64 = 100_000;

/// A daemon entry point; `arg` is the value given at registration and the
/// second parameter is the pool's current iteration
pub type DaemonHook = fn(arg: usize, iteration: i64);

struct DaemonEntry {
    hook: DaemonHook,
    arg: usize,
    frequency: i32,
    offset: i32,
}

/// A pool of periodic daemons sharing one thread
pub struct DaemonPool {
    name: &'static str,
    daemons: Mutex<Vec<DaemonEntry>>,
    iteration: AtomicI64,
}

impl DaemonPool {
    /// Create an empty pool
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            daemons: Mutex::new(Vec::new()),
            iteration: AtomicI64::new(0),
        }
    }

    /// Pool name, for diagnostics
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register `hook` to run every `frequency` ticks.
    ///
    /// The entry's offset is chosen to balance the load: daemons sharing a
    /// frequency get consecutive offsets so they run on different ticks.
    pub fn register(&self, hook: DaemonHook, arg: usize, frequency: i32) -> VmResult<()> {
        if frequency < 1 {
            return Err(VmError::BadValue);
        }

        let mut daemons = self.daemons.lock();
        let offset = if frequency > 1 {
            let same = daemons
                .iter()
                .filter(|entry| entry.frequency == frequency)
                .count() as i32;
            same % frequency
        } else {
            0
        };

        log::debug!(
            "{}: registering daemon at frequency {frequency}, offset {offset}",
            self.name
        );
        daemons.push(DaemonEntry {
            hook,
            arg,
            frequency,
            offset,
        });
        Ok(())
    }

    /// Remove the daemon registered with exactly `(hook, arg)`
    pub fn unregister(&self, hook: DaemonHook, arg: usize) -> VmResult<()> {
        let mut daemons = self.daemons.lock();
        let position = daemons
            .iter()
            .position(|entry| entry.hook == hook && entry.arg == arg)
            .ok_or(VmError::NotFound)?;
        daemons.remove(position);
        Ok(())
    }

    /// Number of registered daemons
    pub fn len(&self) -> usize {
        self.daemons.lock().len()
    }

    /// Whether the pool has no daemons
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry as `(arg, frequency, offset)`, for diagnostics
    pub fn for_each(&self, mut f: impl FnMut(usize, i32, i32)) {
        for entry in self.daemons.lock().iter() {
            f(entry.arg, entry.frequency, entry.offset);
        }
    }

    /// Iterations run so far
    pub fn iteration(&self) -> i64 {
        self.iteration.load(Ordering::Relaxed)
    }

    /// Run one tick: invoke every daemon due this iteration.
    ///
    /// Due entries are snapshotted and invoked with the pool unlocked.
    pub fn tick(&self) {
        let iteration = self.iteration.load(Ordering::Relaxed);

        let due: Vec<(DaemonHook, usize)> = {
            let daemons = self.daemons.lock();
            daemons
                .iter()
                .filter(|entry| (iteration + entry.offset as i64) % entry.frequency as i64 == 0)
                .map(|entry| (entry.hook, entry.arg))
                .collect()
        };

        for (hook, arg) in due {
            hook(arg, iteration);
        }

        self.iteration.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `count` ticks back to back
    pub fn run_ticks(&self, count: u64) {
        for _ in 0..count {
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static COUNTERS: [AtomicUsize; 4] = [
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
    ];

    fn counting_hook(arg: usize, _iteration: i64) {
        COUNTERS[arg].fetch_add(1, Ordering::Relaxed);
    }

    fn reset(slot: usize) {
        COUNTERS[slot].store(0, Ordering::Relaxed);
    }

    fn count(slot: usize) -> usize {
        COUNTERS[slot].load(Ordering::Relaxed)
    }

    #[test]
    fn test_rejects_bad_frequency() {
        let pool = DaemonPool::new("test pool");
        assert_eq!(pool.register(counting_hook, 0, 0), Err(VmError::BadValue));
    }

    #[test]
    fn test_same_frequency_daemons_are_staggered() {
        reset(0);
        reset(1);
        let pool = DaemonPool::new("test pool");
        pool.register(counting_hook, 0, 5).unwrap();
        pool.register(counting_hook, 1, 5).unwrap();

        let mut offsets = Vec::new();
        pool.for_each(|_, _, offset| offsets.push(offset));
        assert_eq!(offsets, alloc::vec![0, 1]);

        pool.run_ticks(20);
        assert_eq!(count(0), 4);
        assert_eq!(count(1), 4);
    }

    #[test]
    fn test_frequency_one_runs_every_tick() {
        reset(2);
        let pool = DaemonPool::new("test pool");
        pool.register(counting_hook, 2, 1).unwrap();
        pool.run_ticks(7);
        assert_eq!(count(2), 7);
    }

    #[test]
    fn test_unregister_stops_invocations() {
        reset(3);
        let pool = DaemonPool::new("test pool");
        pool.register(counting_hook, 3, 1).unwrap();
        pool.run_ticks(3);
        pool.unregister(counting_hook, 3).unwrap();
        pool.run_ticks(3);
        assert_eq!(count(3), 3);

        assert_eq!(
            pool.unregister(counting_hook, 3),
            Err(VmError::NotFound)
        );
    }

    #[test]
    fn test_offsets_wrap_within_frequency() {
        let pool = DaemonPool::new("test pool");
        for slot in 0..3 {
            pool.register(counting_hook, slot, 2).unwrap();
        }
        let mut offsets = Vec::new();
        pool.for_each(|_, _, offset| offsets.push(offset));
        assert_eq!(offsets, alloc::vec![0, 1, 0]);
    }
}
