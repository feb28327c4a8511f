//! Per-dialog exclusive sections.
//!
//! Concurrent events for the same dialog must not both decide to create
//! it. [`DialogLocks`] hands out one async mutex per dialog id; waiters are
//! woken by tokio when the holder drops its [`DialogGuard`], and the entry
//! is removed once nobody holds or waits on it, including waiters whose
//! future was dropped before acquiring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters.
    users: usize,
}

type Slots = Arc<Mutex<HashMap<i64, Slot>>>;

#[derive(Debug, Default, Clone)]
pub struct DialogLocks {
    slots: Slots,
}

impl DialogLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `dialog_id`.
    ///
    /// Dropping the returned future before it resolves gives up the place
    /// in line and releases the entry.
    pub async fn lock(&self, dialog_id: i64) -> DialogGuard {
        let (mutex, registration) = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry(dialog_id).or_default();
            slot.users += 1;
            (
                slot.mutex.clone(),
                Registration {
                    dialog_id,
                    slots: self.slots.clone(),
                },
            )
        };
        let guard = mutex.lock_owned().await;
        DialogGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Number of dialogs currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One holder's or waiter's claim on a map entry.
struct Registration {
    dialog_id: i64,
    slots: Slots,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&self.dialog_id) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(&self.dialog_id);
            }
        }
    }
}

/// Holds a dialog's section until dropped.
pub struct DialogGuard {
    // Fields drop in order: unlock, then deregister.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}
