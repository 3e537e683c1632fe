//! Activation gate shared by a node's two loops
//!
//! Holds the node's active flag and its cancellation state. An idle loop
//! blocks in a `select!` on its queue, the cancel signal and an activation
//! signal, so activation wakes it immediately and an idle node costs nothing.
//!
//! Cancellation is a channel that never carries a value: the sender is
//! dropped on cancel, which disconnects every receiver at once.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct GateState {
    active: bool,
    cancelled: bool,
}

pub(crate) struct Gate {
    state: Mutex<GateState>,
    /// One single-slot channel per subscribed loop
    activation: Mutex<Vec<Sender<()>>>,
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
}

impl Gate {
    /// New gate, inactive and not cancelled
    pub(crate) fn new() -> Self {
        let (cancel_tx, cancel_rx) = bounded(0);
        Self {
            state: Mutex::new(GateState {
                active: false,
                cancelled: false,
            }),
            activation: Mutex::new(Vec::new()),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Set the active flag, returning the previous value
    pub(crate) fn set_active(&self, active: bool) -> bool {
        let previous = {
            let mut state = self.lock();
            std::mem::replace(&mut state.active, active)
        };
        if active && !previous {
            let subscribers = self
                .activation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for tx in subscribers.iter() {
                // A pending wake-up is as good as a new one
                let _ = tx.try_send(());
            }
        }
        previous
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Cancel both loops. Idempotent.
    pub(crate) fn cancel(&self) {
        self.lock().cancelled = true;
        self.cancel_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Receiver that disconnects once the gate is cancelled
    pub(crate) fn cancel_signal(&self) -> Receiver<()> {
        self.cancel_rx.clone()
    }

    /// Receiver that gets a token whenever the node goes from inactive to
    /// active. Each loop subscribes its own.
    pub(crate) fn activation_signal(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.activation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}
