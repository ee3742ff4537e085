//! Generic state-change emitter used by both the connection and channels.
//!
//! Listeners run on their own tasks, fed from a broadcast channel, so a slow
//! listener never blocks the dispatcher. A listener that lags loses its
//! oldest pending events (with a logged warning) rather than stalling anyone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EMITTER_CAPACITY: usize = 32;

/// Emits `(event, payload)` pairs to registered listeners in emission order
/// per listener. Internally synchronized; listener add/remove is safe during
/// dispatch.
pub struct Emitter<E, D> {
    tx: broadcast::Sender<(E, D)>,
    listeners: Arc<Mutex<Vec<(u64, JoinHandle<()>)>>>,
    next_id: AtomicU64,
}

/// Disposer for one registered listener.
pub struct ListenerGuard {
    id: u64,
    listeners: Arc<Mutex<Vec<(u64, JoinHandle<()>)>>>,
}

impl ListenerGuard {
    /// Unregister the listener. Events already queued to it are discarded.
    pub fn off(self) {
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        if let Some(i) = listeners.iter().position(|(id, _)| *id == self.id) {
            let (_, handle) = listeners.swap_remove(i);
            handle.abort();
        }
    }
}

impl<E, D> Emitter<E, D>
where
    E: Clone + PartialEq + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EMITTER_CAPACITY);
        Emitter {
            tx,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener for one event.
    pub fn on(
        &self,
        event: E,
        listener: impl FnMut(D) + Send + 'static,
    ) -> ListenerGuard {
        self.register(Some(event), false, listener)
    }

    /// Register a listener invoked at most once.
    pub fn once(
        &self,
        event: E,
        listener: impl FnMut(D) + Send + 'static,
    ) -> ListenerGuard {
        self.register(Some(event), true, listener)
    }

    /// Register a listener for every event.
    pub fn on_all(&self, listener: impl FnMut(D) + Send + 'static) -> ListenerGuard {
        self.register(None, false, listener)
    }

    /// Remove every registered listener.
    pub fn off_all(&self) {
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        for (_, handle) in listeners.drain(..) {
            handle.abort();
        }
    }

    /// Deliver an event to all matching listeners.
    pub fn emit(&self, event: E, data: D) {
        // No listeners is fine.
        let _ = self.tx.send((event, data));
    }

    /// A raw receiver of all events, for internal state-waiting.
    pub fn subscribe(&self) -> broadcast::Receiver<(E, D)> {
        self.tx.subscribe()
    }

    fn register(
        &self,
        event: Option<E>,
        once: bool,
        mut listener: impl FnMut(D) + Send + 'static,
    ) -> ListenerGuard {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((e, data)) => {
                        if let Some(filter) = &event {
                            if e != *filter {
                                continue;
                            }
                        }
                        listener(data);
                        if once {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(dropped = n, "slow listener dropped pending events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .push((id, handle));
        ListenerGuard {
            id,
            listeners: self.listeners.clone(),
        }
    }
}

impl<E, D> Drop for Emitter<E, D> {
    fn drop(&mut self) {
        for (_, handle) in self
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .drain(..)
        {
            handle.abort();
        }
    }
}
