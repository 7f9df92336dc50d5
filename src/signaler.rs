//! Coalescing fan-out of "index updated" signals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Receiving side of a subscription. Each pending signal occupies a single
/// slot, so bursts of updates collapse into one wake-up.
pub struct Listener {
    pub id: u64,
    rx: mpsc::Receiver<()>,
}

impl Listener {
    /// Waits for the next signal. Returns `None` once the signaler is closed
    /// or this listener was unregistered.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[derive(Default)]
pub struct Signaler {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Signaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self) -> Listener {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.closed.load(Ordering::Acquire) {
            self.listeners.lock().insert(id, tx);
        }
        Listener { id, rx }
    }

    pub fn unregister(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }

    /// Notifies every listener without blocking.
    pub fn signal(&self) {
        let listeners = self.listeners.lock();
        for tx in listeners.values() {
            let _ = tx.try_send(());
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
