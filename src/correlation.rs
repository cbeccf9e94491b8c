//! Correlation registry for in-flight requests
//!
//! Pairs each outstanding request with a one-shot completion channel keyed by
//! its `requestId`. Entries leave the registry exactly once: on reply, on
//! explicit rejection, on timeout, or when the session cancels everything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};

struct PendingEntry {
    tx: oneshot::Sender<Result<Value>>,
    created_at: Instant,
    timer: JoinHandle<()>,
}

type PendingMap = Mutex<HashMap<String, PendingEntry>>;

/// Registry of requests awaiting a reply.
///
/// Cloning is cheap and shares the underlying map. Registration spawns a
/// timer task and fails with [`Error::NoRuntime`] outside a tokio runtime.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    pending: Arc<PendingMap>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request that expires after `timeout`.
    ///
    /// Fails with [`Error::DuplicateRequestId`] if the id is already pending.
    pub fn register(&self, request_id: impl Into<String>, timeout: Duration) -> Result<PendingReply> {
        let request_id = request_id.into();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::NoRuntime(e.to_string()))?;
        let mut pending = lock(&self.pending);
        if pending.contains_key(&request_id) {
            return Err(Error::DuplicateRequestId(request_id));
        }

        let (tx, rx) = oneshot::channel();
        let timer = runtime.spawn(expire_after(
            Arc::downgrade(&self.pending),
            request_id.clone(),
            timeout,
        ));
        pending.insert(
            request_id.clone(),
            PendingEntry {
                tx,
                created_at: Instant::now(),
                timer,
            },
        );
        tracing::trace!(request_id = %request_id, timeout_ms = timeout.as_millis() as u64, "registered pending request");

        Ok(PendingReply { request_id, rx })
    }

    /// Fulfil a pending request. Returns `false` for unknown ids.
    pub fn resolve(&self, request_id: &str, value: Value) -> bool {
        self.complete(request_id, Ok(value))
    }

    /// Fail a pending request. Returns `false` for unknown ids.
    pub fn reject(&self, request_id: &str, error: Error) -> bool {
        self.complete(request_id, Err(error))
    }

    /// Reject every pending request with [`Error::Cancelled`]
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (request_id, entry) in drained {
            entry.timer.abort();
            tracing::debug!(request_id = %request_id, reason, "cancelling pending request");
            let _ = entry.tx.send(Err(Error::Cancelled(reason.to_string())));
        }
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        lock(&self.pending).contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    fn complete(&self, request_id: &str, outcome: Result<Value>) -> bool {
        let Some(entry) = lock(&self.pending).remove(request_id) else {
            tracing::warn!(request_id = %request_id, "reply for unknown or expired request id");
            return false;
        };
        entry.timer.abort();
        tracing::trace!(
            request_id = %request_id,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "completed pending request"
        );
        // The waiter may have been dropped; completion still counts.
        let _ = entry.tx.send(outcome);
        true
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

async fn expire_after(pending: Weak<PendingMap>, request_id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(pending) = pending.upgrade() else {
        return;
    };
    let entry = lock(&pending).remove(&request_id);
    if let Some(entry) = entry {
        tracing::warn!(request_id = %request_id, timeout_ms = timeout.as_millis() as u64, "request timed out");
        let _ = entry.tx.send(Err(Error::Timeout {
            request_id,
            after: timeout,
        }));
    }
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the eventual reply of a registered request
#[derive(Debug)]
pub struct PendingReply {
    request_id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the reply, timeout, or cancellation
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Cancelled("registry dropped".to_string())),
        }
    }
}

/// Mints request ids unique for the lifetime of one session.
///
/// Ids are `<prefix>-<n>` with `n` starting at 1 and never reused.
#[derive(Debug)]
pub struct RequestIdSequence {
    prefix: String,
    next: AtomicU64,
}

impl RequestIdSequence {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
