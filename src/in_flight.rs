//! Request coalescing for concurrent misses on the same cache key
//!
//! The first caller to miss becomes the leader and performs the fetch; later
//! callers subscribe to a `watch` channel and receive the leader's outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use crate::error::{ErrorCode, GENERIC_MESSAGE, RequestError};

/// Cloneable form of a leader's failure.
///
/// `UpstreamError` wraps non-`Clone` transport errors, so followers get the
/// mapped code, message and details with `cause: None`. Only the leader's
/// error carries the source; it is logged once by `RequestError::from_upstream`.
#[derive(Debug, Clone)]
pub(crate) struct SharedFailure {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

impl SharedFailure {
    fn into_error(self) -> RequestError {
        RequestError {
            code: self.code,
            message: self.message,
            details: self.details,
            cause: None,
        }
    }
}

type Outcome = Result<Arc<Value>, SharedFailure>;
type Slot = watch::Receiver<Option<Outcome>>;
type Slots = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Default)]
pub(crate) struct InFlight {
    slots: Slots,
}

pub(crate) enum Role {
    Leader(InFlightGuard),
    Follower(Slot),
}

impl InFlight {
    /// Become the leader for `key`, or follow the fetch already running.
    pub fn join(&self, key: &str) -> Role {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = slots.get(key) {
            return Role::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_owned(), rx);
        Role::Leader(InFlightGuard {
            key: key.to_owned(),
            slots: Arc::clone(&self.slots),
            tx: Some(tx),
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Wait for the leader's outcome.
pub(crate) async fn wait(mut rx: Slot) -> Result<Arc<Value>, RequestError> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome.map_err(SharedFailure::into_error);
        }
        if rx.changed().await.is_err() {
            return Err(cancelled());
        }
    }
}

fn cancelled() -> RequestError {
    RequestError::new(ErrorCode::Unknown, GENERIC_MESSAGE)
}

/// Guard that ensures the in-flight slot is released even on panic/cancel.
///
/// When dropped without `complete`, waiters are notified with an error.
pub(crate) struct InFlightGuard {
    key: String,
    slots: Slots,
    tx: Option<watch::Sender<Option<Outcome>>>,
}

impl InFlightGuard {
    /// Publish the result to waiters, consuming the guard.
    pub fn complete(mut self, result: &Result<Arc<Value>, RequestError>) {
        if let Some(tx) = self.tx.take() {
            let outcome = match result {
                Ok(value) => Ok(Arc::clone(value)),
                Err(e) => Err(SharedFailure {
                    code: e.code,
                    message: e.message.clone(),
                    details: e.details.clone(),
                }),
            };
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err(SharedFailure {
                code: ErrorCode::Unknown,
                message: GENERIC_MESSAGE.to_owned(),
                details: None,
            })));
        }
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
