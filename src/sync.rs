//! Cancellation tokens and a mutex whose acquisition can be cancelled.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Selector, Sender};

use crate::{Error, Result};

/// Owner side of a cancellation signal.
///
/// Cancelling (or dropping) the handle wakes every [CancelToken] derived from it.
#[derive(Debug)]
pub struct CancelHandle {
    sender: Mutex<Option<Sender<()>>>,
    token: CancelToken,
}

#[derive(Debug, Clone)]
/// Observer side of a cancellation signal, cheap to clone into threads.
pub struct CancelToken {
    receiver: Receiver<()>,
    // Keeps the channel connected for tokens that are never cancelled.
    _keep_alive: Option<Arc<Sender<()>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = flume::bounded(0);

        CancelHandle {
            sender: Mutex::new(Some(sender)),
            token: CancelToken {
                receiver,
                _keep_alive: None,
            },
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Cancel all tokens, idempotent.
    pub fn cancel(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> CancelToken {
        let (sender, receiver) = flume::bounded(0);

        CancelToken {
            receiver,
            _keep_alive: Some(Arc::new(sender)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.is_disconnected()
    }

    /// Sleep for `duration`, returns `false` if cancelled before it elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let _ = self.receiver.recv();
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

/// A mutex whose lock acquisition observes a [CancelToken] and an optional deadline.
///
/// The lock itself is a channel of capacity one: acquiring sends into it,
/// releasing drains it.
#[derive(Debug)]
pub struct CtxMutex<T> {
    gate_sender: Sender<()>,
    gate_receiver: Receiver<()>,
    value: Mutex<T>,
}

/// Releases the [CtxMutex] when dropped.
pub struct CtxMutexGuard<'a, T> {
    // Dropped before the permit, so the data is unlocked before the gate opens.
    value: MutexGuard<'a, T>,
    _permit: Permit<'a>,
}

struct Permit<'a> {
    gate: &'a Receiver<()>,
}

impl<T> CtxMutex<T> {
    pub fn new(value: T) -> Self {
        let (gate_sender, gate_receiver) = flume::bounded(1);

        CtxMutex {
            gate_sender,
            gate_receiver,
            value: Mutex::new(value),
        }
    }

    /// Wait for the lock, or fail with [Error::Cancelled].
    pub fn lock(&self, cancel: &CancelToken) -> Result<CtxMutexGuard<'_, T>> {
        self.acquire(cancel, None)
    }

    /// Like [Self::lock], but fail with [Error::Timeout] after `timeout`.
    pub fn lock_timeout(
        &self,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<CtxMutexGuard<'_, T>> {
        self.acquire(cancel, Some(Instant::now() + timeout))
    }

    fn acquire(
        &self,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<CtxMutexGuard<'_, T>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let selector = Selector::new()
            // We hold the receiver, so this send can't fail on disconnection.
            .send(&self.gate_sender, (), |result| {
                result.map_err(|_| Error::Cancelled)
            })
            .recv(cancel.receiver(), |_| Err(Error::Cancelled));

        match deadline {
            Some(deadline) => selector.wait_deadline(deadline).unwrap_or(Err(Error::Timeout)),
            None => selector.wait(),
        }?;

        let permit = Permit {
            gate: &self.gate_receiver,
        };

        Ok(CtxMutexGuard {
            value: self.value.lock().unwrap_or_else(|e| e.into_inner()),
            _permit: permit,
        })
    }
}

impl<T> Deref for CtxMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CtxMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let _ = self.gate.try_recv();
    }
}
