//! Authorization gate - single-slot rendezvous for approval signals.
//!
//! At most one action may be pending approval at any time. `arm()` occupies
//! the slot and returns a waiter; `approve()` releases that waiter exactly
//! once. A second `arm()` while the slot is occupied is rejected with
//! [`GateError::Busy`] rather than silently replacing the first waiter.
//!
//! State machine: `Idle → Armed → Idle`. The slot returns to `Idle` when
//! approval fires or when the armed waiter is dropped (action aborted).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// An approval is already pending for another action.
    #[error("an approval is already pending")]
    Busy,
    /// The gate went away while armed. Only reachable during teardown.
    #[error("approval waiter abandoned")]
    Abandoned,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

fn lock_slot(mutex: &StdMutex<Option<Waiter>>) -> MutexGuard<'_, Option<Waiter>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-slot approval gate shared by all gated actions.
pub struct AuthGate {
    slot: StdMutex<Option<Waiter>>,
    next_id: AtomicU64,
}

impl AuthGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: StdMutex::new(None),
            next_id: AtomicU64::new(0),
        })
    }

    /// Occupy the approval slot. Fails with [`GateError::Busy`] if another
    /// action is already armed.
    pub fn arm(self: &Arc<Self>) -> Result<Armed, GateError> {
        let mut slot = lock_slot(&self.slot);
        if slot.is_some() {
            return Err(GateError::Busy);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *slot = Some(Waiter { id, tx });
        Ok(Armed {
            gate: Arc::clone(self),
            id,
            rx,
        })
    }

    /// Release the armed waiter, if any. Returns whether a waiter existed;
    /// approving with nothing pending is a no-op, never an error.
    pub fn approve(&self) -> bool {
        match lock_slot(&self.slot).take() {
            Some(waiter) => {
                // The waiter may have been dropped concurrently; releasing a
                // dead receiver is still a consumed approval.
                let _ = waiter.tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        lock_slot(&self.slot).is_some()
    }

    fn clear_if_current(&self, id: u64) {
        let mut slot = lock_slot(&self.slot);
        if slot.as_ref().is_some_and(|w| w.id == id) {
            *slot = None;
        }
    }
}

/// An occupied approval slot. Await [`Armed::approved`] to suspend until the
/// external approval event; dropping it returns the gate to `Idle`.
pub struct Armed {
    gate: Arc<AuthGate>,
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl Armed {
    /// Suspend until `approve()` fires. Unbounded: no timeout is imposed by
    /// the gate itself.
    pub async fn approved(mut self) -> Result<(), GateError> {
        (&mut self.rx).await.map_err(|_| GateError::Abandoned)
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        self.gate.clear_if_current(self.id);
    }
}
