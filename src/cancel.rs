//! Shutdown signalling shared by every pipeline thread
//!
//! `CancelToken` is the one cancellation signal threaded through capture,
//! fan-out and persistence. It is built on a crossbeam channel that never
//! carries a message: cancelling drops the only sender, so every clone of
//! the receiver becomes ready at once and can sit in a `select!` next to
//! a data channel.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Uninhabited message type for the signal channel
#[derive(Debug)]
pub enum Never {}

struct Inner {
    trigger: Mutex<Option<Sender<Never>>>,
    signal: Receiver<Never>,
    cancelled: AtomicBool,
}

/// Cloneable cancellation handle
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<Never>(0);
        Self {
            inner: Arc::new(Inner {
                trigger: Mutex::new(Some(tx)),
                signal: rx,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Cancel the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once cancelled.
    ///
    /// Meant for `crossbeam_channel::select!`; a receive on it never yields
    /// a value, only the disconnection error.
    pub fn signal(&self) -> &Receiver<Never> {
        &self.inner.signal
    }

    /// Block until cancelled
    pub fn wait(&self) {
        let _ = self.inner.signal.recv();
    }

    /// Block until cancelled or the timeout elapses.
    /// Returns true if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Ok(never) => match never {},
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Records the first error reported by a component; later ones are ignored.
pub struct FirstError<E> {
    slot: Mutex<Option<E>>,
    component: &'static str,
}

impl<E: Clone + fmt::Display> FirstError<E> {
    pub fn new(component: &'static str) -> Self {
        Self {
            slot: Mutex::new(None),
            component,
        }
    }

    /// Store `err` unless an error was already recorded.
    /// Returns true if this call recorded it.
    pub fn set(&self, err: E) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            tracing::debug!("{}: suppressed later error: {}", self.component, err);
            return false;
        }
        tracing::error!("{} error: {}", self.component, err);
        *slot = Some(err);
        true
    }

    pub fn get(&self) -> Option<E> {
        self.slot.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}
