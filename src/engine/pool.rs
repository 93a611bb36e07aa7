//! Fixed-size pool of inference contexts.
//!
//! Each slot wraps one non-reentrant engine. Leasing moves the engine out
//! of the slot and into a [`SlotHandle`], so handing the same slot to two
//! callers is impossible by construction; releasing moves it back and
//! wakes anyone napping on the pool.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::engine::speech::SpeechEngine;

/// An exclusively leased context. Dropping a handle without releasing it
/// permanently shrinks the pool, so the worker and teardown paths always
/// hand it back via [`ContextPool::release`].
pub struct SlotHandle {
    id: u32,
    engine: Box<dyn SpeechEngine>,
}

impl SlotHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn engine_mut(&mut self) -> &mut dyn SpeechEngine {
        &mut *self.engine
    }
}

pub struct ContextPool {
    // None = leased out, Some = idle. Index is the slot id.
    slots: Mutex<Vec<Option<Box<dyn SpeechEngine>>>>,
    released: Condvar,
}

impl ContextPool {
    pub fn new(engines: Vec<Box<dyn SpeechEngine>>) -> Self {
        Self {
            slots: Mutex::new(engines.into_iter().map(Some).collect()),
            released: Condvar::new(),
        }
    }

    /// Total slot count (fixed for the pool's lifetime).
    pub fn len(&self) -> usize {
        self.slots.lock().expect("context pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_count(&self) -> usize {
        self.slots
            .lock()
            .expect("context pool lock poisoned")
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Non-blocking scan: first idle slot wins, in index order. `None`
    /// means every context is busy — not an error, the caller retries on
    /// a later tick.
    pub fn try_lease(&self) -> Option<SlotHandle> {
        let mut slots = self.slots.lock().expect("context pool lock poisoned");
        for (id, slot) in slots.iter_mut().enumerate() {
            if let Some(engine) = slot.take() {
                tracing::debug!(slot = id, "leased context");
                return Some(SlotHandle {
                    id: id as u32,
                    engine,
                });
            }
        }
        None
    }

    pub fn release(&self, handle: SlotHandle) {
        let mut slots = self.slots.lock().expect("context pool lock poisoned");
        let id = handle.id as usize;
        debug_assert!(slots[id].is_none(), "slot released twice");
        slots[id] = Some(handle.engine);
        tracing::debug!(slot = id, "released context");
        self.released.notify_all();
    }

    /// Park until a slot is released or `timeout` elapses. Returns
    /// immediately when a slot is already idle. The worker uses this as
    /// its inter-tick nap whenever a speaking session is still waiting
    /// for a context.
    pub fn wait_for_release(&self, timeout: Duration) {
        let slots = self.slots.lock().expect("context pool lock poisoned");
        if slots.iter().any(|s| s.is_some()) {
            return;
        }
        let _unused = self
            .released
            .wait_timeout(slots, timeout)
            .expect("context pool lock poisoned");
    }
}
