//! Execution contexts and the per-shard execution cache.
//!
//! An execution context owns the cached [`MutableState`] of one execution.
//! The cache hands out exclusive access to a context: one writer per
//! execution, acquired with a timeout. A call that fails leaves its context
//! cleared, so the next one starts from the persisted execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{HistoryError, Result};
use crate::identifier::WorkflowIdentifier;
use crate::state::MutableState;

/// Interval between lock attempts while waiting for an execution.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Operations the conflict resolver needs from an execution context.
pub trait ExecutionContext {
    /// Drop the cached state and anything derived from it.
    fn clear(&mut self);

    /// Record the history size, in bytes, of the active state.
    fn set_history_size(&mut self, size: i64);
}

/// Cached state of one execution.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    id: WorkflowIdentifier,
    mutable_state: Option<Arc<MutableState>>,
    history_size: i64,
}

impl WorkflowContext {
    #[must_use]
    pub const fn new(id: WorkflowIdentifier) -> Self {
        Self {
            id,
            mutable_state: None,
            history_size: 0,
        }
    }

    /// Execution this context caches.
    #[must_use]
    pub const fn identifier(&self) -> &WorkflowIdentifier {
        &self.id
    }

    /// The cached state, if loaded.
    #[must_use]
    pub const fn mutable_state(&self) -> Option<&Arc<MutableState>> {
        self.mutable_state.as_ref()
    }

    /// Install a state that has been persisted.
    pub fn set_mutable_state(&mut self, mutable_state: Arc<MutableState>) {
        self.mutable_state = Some(mutable_state);
    }

    /// History size, in bytes, recorded for the cached state.
    #[must_use]
    pub const fn history_size(&self) -> i64 {
        self.history_size
    }
}

impl ExecutionContext for WorkflowContext {
    fn clear(&mut self) {
        debug!(execution = %self.id, "clearing cached mutable state");
        self.mutable_state = None;
        self.history_size = 0;
    }

    fn set_history_size(&mut self, size: i64) {
        self.history_size = size;
    }
}

type Slot = Arc<Mutex<WorkflowContext>>;

#[derive(Debug)]
struct CachedSlot {
    slot: Slot,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Contexts {
    slots: HashMap<WorkflowIdentifier, CachedSlot>,
    clock: u64,
}

impl Contexts {
    const fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop the least recently used context nobody holds.
    fn evict_idle(&mut self) -> Option<WorkflowIdentifier> {
        let victim = self
            .slots
            .iter()
            .filter(|(_, cached)| Arc::strong_count(&cached.slot) == 1)
            .min_by_key(|(_, cached)| cached.last_used)
            .map(|(id, _)| id.clone())?;
        self.slots.remove(&victim);
        Some(victim)
    }
}

/// Per-shard map from execution to its context.
#[derive(Debug)]
pub struct ExecutionCache {
    contexts: Mutex<Contexts>,
    lock_timeout: Duration,
    max_executions: usize,
}

impl ExecutionCache {
    #[must_use]
    pub fn new(lock_timeout: Duration, max_executions: usize) -> Self {
        Self {
            contexts: Mutex::new(Contexts::default()),
            lock_timeout,
            max_executions: max_executions.max(1),
        }
    }

    /// Number of cached contexts.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::StorageUnavailable`] if the cache lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.contexts()?.slots.len())
    }

    /// True when nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::StorageUnavailable`] if the cache lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Run `f` with exclusive access to the execution's context.
    ///
    /// Waits up to the configured lock timeout for a concurrent writer. A
    /// context poisoned by a panicking writer is cleared before reuse, and
    /// one whose `f` fails is cleared afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::LockTimeout`] if the lock is not acquired in
    /// time, otherwise whatever `f` returns.
    pub fn with_execution<T>(
        &self,
        id: &WorkflowIdentifier,
        f: impl FnOnce(&mut WorkflowContext) -> Result<T>,
    ) -> Result<T> {
        let slot = self.slot(id)?;
        let start = Instant::now();
        loop {
            match slot.try_lock() {
                Ok(mut guard) => return release(&mut guard, f),
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!(execution = %id, "execution context poisoned; dropping cached state");
                    let mut guard = poisoned.into_inner();
                    guard.clear();
                    slot.clear_poison();
                    return release(&mut guard, f);
                }
                Err(TryLockError::WouldBlock) => {}
            }

            let waited = start.elapsed();
            if waited >= self.lock_timeout {
                return Err(HistoryError::LockTimeout {
                    execution: id.to_string(),
                    waited,
                });
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn contexts(&self) -> Result<MutexGuard<'_, Contexts>> {
        self.contexts
            .lock()
            .map_err(|_| HistoryError::StorageUnavailable("execution cache lock poisoned".into()))
    }

    fn slot(&self, id: &WorkflowIdentifier) -> Result<Slot> {
        let mut contexts = self.contexts()?;
        let now = contexts.tick();
        if let Some(cached) = contexts.slots.get_mut(id) {
            cached.last_used = now;
            return Ok(Arc::clone(&cached.slot));
        }

        if contexts.slots.len() >= self.max_executions {
            // With every context held the cache grows past its limit.
            if let Some(evicted) = contexts.evict_idle() {
                debug!(execution = %evicted, "evicted idle execution context");
            }
        }
        let slot = Arc::new(Mutex::new(WorkflowContext::new(id.clone())));
        contexts.slots.insert(
            id.clone(),
            CachedSlot {
                slot: Arc::clone(&slot),
                last_used: now,
            },
        );
        Ok(slot)
    }
}

/// Run `f`, dropping the cached state if it fails.
fn release<T>(
    context: &mut WorkflowContext,
    f: impl FnOnce(&mut WorkflowContext) -> Result<T>,
) -> Result<T> {
    let result = f(context);
    if result.is_err() {
        context.clear();
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn id(workflow: &str) -> WorkflowIdentifier {
        WorkflowIdentifier::new("d", workflow, "r")
    }

    #[test]
    fn clear_drops_state_and_size() {
        let mut context = WorkflowContext::new(id("wf"));
        context.set_mutable_state(Arc::new(MutableState::new(&id("wf"), "b".into())));
        context.set_history_size(12_345);
        assert_eq!(context.history_size(), 12_345);

        context.clear();
        assert!(context.mutable_state().is_none());
        assert_eq!(context.history_size(), 0);
    }

    #[test]
    fn context_persists_between_calls() {
        let cache = ExecutionCache::new(Duration::from_secs(1), 16);
        cache
            .with_execution(&id("wf"), |context| {
                context.set_history_size(7);
                Ok(())
            })
            .unwrap();
        let size = cache
            .with_execution(&id("wf"), |context| Ok(context.history_size()))
            .unwrap();
        assert_eq!(size, 7);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn contended_lock_times_out() {
        let cache = Arc::new(ExecutionCache::new(Duration::from_millis(50), 16));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache
                    .with_execution(&id("wf"), |_| {
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        locked_rx.recv().unwrap();
        let err = cache
            .with_execution(&id("wf"), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, HistoryError::LockTimeout { .. }));
        assert!(err.kind().is_retryable());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(cache.with_execution(&id("wf"), |_| Ok(())).is_ok());
    }

    fn cached(cache: &ExecutionCache, workflow: &str) -> bool {
        cache.contexts().unwrap().slots.contains_key(&id(workflow))
    }

    #[test]
    fn least_recently_used_context_is_evicted_at_capacity() {
        let cache = ExecutionCache::new(Duration::from_secs(1), 2);
        for name in ["a", "b", "a", "c"] {
            cache.with_execution(&id(name), |_| Ok(())).unwrap();
        }
        assert_eq!(cache.len().unwrap(), 2);
        assert!(cached(&cache, "a"));
        assert!(!cached(&cache, "b"));
        assert!(cached(&cache, "c"));
    }

    #[test]
    fn held_contexts_are_never_evicted() {
        let cache = ExecutionCache::new(Duration::from_secs(1), 1);
        cache
            .with_execution(&id("a"), |_| {
                cache.with_execution(&id("b"), |_| Ok(()))?;
                cache.with_execution(&id("c"), |_| Ok(()))
            })
            .unwrap();
        assert!(cached(&cache, "a"));
        assert!(!cached(&cache, "b"));
        assert!(cached(&cache, "c"));
        assert_eq!(cache.len().unwrap(), 2);
    }

    #[test]
    fn failed_call_clears_context() {
        let cache = ExecutionCache::new(Duration::from_secs(1), 16);
        cache
            .with_execution(&id("wf"), |context| {
                context.set_mutable_state(Arc::new(MutableState::new(&id("wf"), "b".into())));
                context.set_history_size(9);
                Ok(())
            })
            .unwrap();

        let err = cache
            .with_execution(&id("wf"), |_| -> Result<()> {
                Err(HistoryError::ConditionFailed {
                    expected: 1,
                    actual: 2,
                })
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        let (loaded, size) = cache
            .with_execution(&id("wf"), |context| {
                Ok((context.mutable_state().is_some(), context.history_size()))
            })
            .unwrap();
        assert!(!loaded);
        assert_eq!(size, 0);
    }
}
