//! Keyed, re-entrant lock pool.
//!
//! A [`LockPool`] hands out one exclusive, re-entrant lock per key. Slots
//! are created on first use and removed as soon as nobody holds or waits
//! for them, so the pool only ever contains keys that are in use. Hold and
//! waiter counts change only under the pool mutex, which keeps slot removal
//! race-free. Each slot has its own condition variable: releasing one key
//! never wakes threads waiting for another.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

struct Slot {
    owner: Option<ThreadId>,
    holds: usize,
    waiters: usize,
    cond: Arc<Condvar>,
}

impl Slot {
    fn new() -> Self {
        Self {
            owner: None,
            holds: 0,
            waiters: 0,
            cond: Arc::new(Condvar::new()),
        }
    }

    fn is_idle(&self) -> bool {
        self.holds == 0 && self.waiters == 0
    }
}

struct PoolState<K> {
    slots: HashMap<K, Slot>,
    interrupted: bool,
}

impl<K: Hash + Eq + Clone> PoolState<K> {
    fn slot(&mut self, key: &K) -> &mut Slot {
        self.slots.entry(key.clone()).or_insert_with(Slot::new)
    }

    fn remove_if_idle(&mut self, key: &K) {
        if self.slots.get(key).is_some_and(Slot::is_idle) {
            self.slots.remove(key);
        }
    }
}

#[derive(Clone, Copy)]
enum Wait {
    Never,
    Until(Instant),
    Forever,
}

/// Map of re-entrant locks keyed by an arbitrary hashable key.
pub struct LockPool<K> {
    state: Mutex<PoolState<K>>,
}

impl<K: Hash + Eq + Clone> LockPool<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                interrupted: false,
            }),
        }
    }

    /// Block until the calling thread owns `key`.
    ///
    /// Re-entrant: a thread that already owns `key` acquires it again
    /// immediately and must call [`unlock`](Self::unlock) once per
    /// acquisition. Fails with [`StoreError::Interrupted`] if the pool is
    /// interrupted while waiting.
    pub fn lock(&self, key: &K) -> StoreResult<()> {
        self.acquire(key, Wait::Forever).map(|_| ())
    }

    /// Acquire `key` only if that is possible without waiting.
    pub fn try_lock(&self, key: &K) -> StoreResult<bool> {
        self.acquire(key, Wait::Never)
    }

    /// Acquire `key`, waiting at most `timeout`.
    pub fn try_lock_for(&self, key: &K, timeout: Duration) -> StoreResult<bool> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.acquire(key, Wait::Until(deadline)),
            None => self.acquire(key, Wait::Forever).map(|_| true),
        }
    }

    /// Release one level of ownership of `key`.
    pub fn unlock(&self, key: &K) -> StoreResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let slot = match state.slots.get_mut(key) {
            Some(slot) if slot.owner == Some(me) => slot,
            _ => return Err(StoreError::NotLockOwner),
        };
        slot.holds -= 1;
        if slot.holds > 0 {
            return Ok(());
        }
        slot.owner = None;
        if slot.waiters > 0 {
            slot.cond.notify_one();
        } else {
            state.slots.remove(key);
        }
        Ok(())
    }

    /// Acquire `key` and return a guard that releases it on drop.
    pub fn guard(&self, key: K) -> StoreResult<PoolGuard<'_, K>> {
        self.lock(&key)?;
        Ok(PoolGuard { pool: self, key })
    }

    /// Wake every blocked waiter with [`StoreError::Interrupted`] and make
    /// every later blocking acquisition fail the same way.
    ///
    /// Locks already held stay held and can still be released.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        for slot in state.slots.values() {
            slot.cond.notify_all();
        }
        debug!(slots = state.slots.len(), "lock pool interrupted");
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// Returns `true` if the calling thread currently owns `key`.
    pub fn held_by_current_thread(&self, key: &K) -> bool {
        let me = thread::current().id();
        self.state
            .lock()
            .slots
            .get(key)
            .is_some_and(|slot| slot.owner == Some(me))
    }

    /// Number of keys currently held or waited for.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(&self, key: &K, wait: Wait) -> StoreResult<bool> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let slot = state.slot(key);
        match slot.owner {
            None => {
                slot.owner = Some(me);
                slot.holds = 1;
                return Ok(true);
            }
            Some(owner) if owner == me => {
                slot.holds += 1;
                return Ok(true);
            }
            Some(_) => {}
        }
        if let Wait::Never = wait {
            return Ok(false);
        }
        if state.interrupted {
            return Err(StoreError::Interrupted);
        }

        let slot = state.slot(key);
        slot.waiters += 1;
        let cond = Arc::clone(&slot.cond);
        loop {
            let timed_out = match wait {
                Wait::Forever => {
                    cond.wait(&mut state);
                    false
                }
                Wait::Until(deadline) => cond.wait_until(&mut state, deadline).timed_out(),
                Wait::Never => true,
            };
            let interrupted = state.interrupted;
            let slot = state.slot(key);
            if interrupted {
                slot.waiters -= 1;
                state.remove_if_idle(key);
                return Err(StoreError::Interrupted);
            }
            if slot.owner.is_none() {
                slot.waiters -= 1;
                slot.owner = Some(me);
                slot.holds = 1;
                return Ok(true);
            }
            if timed_out {
                slot.waiters -= 1;
                return Ok(false);
            }
        }
    }
}

impl<K: Hash + Eq + Clone> Default for LockPool<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for LockPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockPool")
            .field("slots", &state.slots.len())
            .field("interrupted", &state.interrupted)
            .finish()
    }
}

/// Releases one level of a [`LockPool`] key on drop.
pub struct PoolGuard<'a, K: Hash + Eq + Clone> {
    pool: &'a LockPool<K>,
    key: K,
}

impl<K: Hash + Eq + Clone> Drop for PoolGuard<'_, K> {
    fn drop(&mut self) {
        // The guard owns exactly one acquisition, so this cannot fail.
        let _ = self.pool.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn lock_and_unlock_removes_slot() {
        let pool = LockPool::new();
        pool.lock(&1u32).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.held_by_current_thread(&1));
        pool.unlock(&1).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn reentrant_for_same_thread() {
        let pool = LockPool::new();
        pool.lock(&"k").unwrap();
        pool.lock(&"k").unwrap();
        assert!(pool.try_lock(&"k").unwrap());
        pool.unlock(&"k").unwrap();
        pool.unlock(&"k").unwrap();
        assert!(pool.held_by_current_thread(&"k"));
        pool.unlock(&"k").unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn unlock_without_ownership_is_rejected() {
        let pool: LockPool<u32> = LockPool::new();
        assert!(matches!(pool.unlock(&7), Err(StoreError::NotLockOwner)));

        let pool = Arc::new(pool);
        pool.lock(&7).unwrap();
        let other = Arc::clone(&pool);
        let result = thread::spawn(move || other.unlock(&7)).join().unwrap();
        assert!(matches!(result, Err(StoreError::NotLockOwner)));
        pool.unlock(&7).unwrap();
    }

    #[test]
    fn try_lock_fails_while_held_elsewhere() {
        let pool = Arc::new(LockPool::new());
        pool.lock(&1u32).unwrap();
        let other = Arc::clone(&pool);
        let acquired = thread::spawn(move || other.try_lock(&1).unwrap()).join().unwrap();
        assert!(!acquired);
        pool.unlock(&1).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn try_lock_for_times_out_and_cleans_up() {
        let pool = Arc::new(LockPool::new());
        pool.lock(&1u32).unwrap();
        let other = Arc::clone(&pool);
        let acquired = thread::spawn(move || {
            other.try_lock_for(&1, Duration::from_millis(20)).unwrap()
        })
        .join()
        .unwrap();
        assert!(!acquired);
        pool.unlock(&1).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn waiter_acquires_after_release() {
        let pool = Arc::new(LockPool::new());
        pool.lock(&1u32).unwrap();
        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            other.lock(&1).unwrap();
            tx.send(()).unwrap();
            other.unlock(&1).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        pool.unlock(&1).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn different_keys_do_not_block() {
        let pool = Arc::new(LockPool::new());
        pool.lock(&1u32).unwrap();
        let other = Arc::clone(&pool);
        let acquired = thread::spawn(move || {
            let ok = other.try_lock(&2).unwrap();
            other.unlock(&2).unwrap();
            ok
        })
        .join()
        .unwrap();
        assert!(acquired);
        pool.unlock(&1).unwrap();
    }

    #[test]
    fn interrupt_wakes_waiters() {
        let pool = Arc::new(LockPool::new());
        pool.lock(&1u32).unwrap();
        let other = Arc::clone(&pool);
        let handle = thread::spawn(move || other.lock(&1));
        // Give the waiter time to block.
        thread::sleep(Duration::from_millis(50));
        pool.interrupt();
        assert!(matches!(handle.join().unwrap(), Err(StoreError::Interrupted)));
        assert!(pool.is_interrupted());

        // Held locks can still be released; new blocking waits fail fast.
        pool.unlock(&1).unwrap();
        assert!(pool.is_empty());
        let other = Arc::clone(&pool);
        pool.lock(&2).unwrap();
        let result = thread::spawn(move || other.lock(&2)).join().unwrap();
        assert!(matches!(result, Err(StoreError::Interrupted)));
        pool.unlock(&2).unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let pool = LockPool::new();
        {
            let _guard = pool.guard(5u32).unwrap();
            assert!(pool.held_by_current_thread(&5));
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let pool = Arc::new(LockPool::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let inside = Arc::clone(&inside);
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    for _ in 0..200 {
                        pool.lock(&"shared").unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        pool.unlock(&"shared").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 1600);
        assert!(pool.is_empty());
    }
}
