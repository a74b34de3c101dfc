//! Correlation table: pending request waiters keyed by `req_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::transport::Transport;
use crate::api::frame::{self, REQ_ID};
use crate::error::{EngineError, EngineResult};

/// An outstanding request awaiting its response.
struct PendingRequest {
    issued_at: Instant,
    slot: oneshot::Sender<EngineResult<Value>>,
}

/// Maps outgoing correlation ids to their waiters.
///
/// All map mutation goes through one mutex; it is never held across an
/// `.await`.
pub struct CorrelationTable {
    transport: Arc<Transport>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl CorrelationTable {
    pub fn new(transport: Arc<Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next auto-assigned id that is not outstanding. Monotonic, and skips
    /// ids a caller has taken with [`send`](Self::send). Must be called with
    /// the map locked.
    fn allocate_id(&self, pending: &HashMap<u64, PendingRequest>) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Send with an auto-assigned id and await the response body.
    pub async fn request(&self, payload: Value) -> EngineResult<Value> {
        let (id, rx) = self.register(payload, None)?;
        self.wait(id, rx).await
    }

    /// Send with a caller-chosen id and await the response.
    ///
    /// Fails with `DuplicateCorrelation` without sending if `id` is already
    /// outstanding. A response carrying an error object rejects with
    /// `Remote`; no response within the timeout rejects with
    /// `RequestTimeout` and frees the id.
    pub async fn send(&self, payload: Value, id: u64) -> EngineResult<Value> {
        let (id, rx) = self.register(payload, Some(id))?;
        self.wait(id, rx).await
    }

    async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<EngineResult<Value>>,
    ) -> EngineResult<Value> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a result: only happens on teardown
            Ok(Err(_)) => Err(EngineError::SessionDisposed),
            Err(_) => {
                if let Some(entry) = self.lock().remove(&id) {
                    debug!(
                        req_id = id,
                        elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                        "Request timed out"
                    );
                }
                Err(EngineError::RequestTimeout(id))
            }
        }
    }

    /// Send now and log the outcome from a spawned task. Used for
    /// best-effort requests (`forget`, keep-alive) whose result nobody awaits.
    pub fn send_detached(self: &Arc<Self>, payload: Value) -> EngineResult<u64> {
        let (id, rx) = self.register(payload, None)?;

        let table = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::time::timeout(table.timeout, rx).await {
                Ok(Ok(Ok(_))) => debug!(req_id = id, "Detached request acknowledged"),
                Ok(Ok(Err(e))) => debug!(req_id = id, error = %e, "Detached request rejected"),
                Ok(Err(_)) => {}
                Err(_) => {
                    table.lock().remove(&id);
                    debug!(req_id = id, "Detached request timed out");
                }
            }
        });

        Ok(id)
    }

    /// Insert the waiter under `id` (or a freshly allocated one) and write
    /// the frame. The entry is removed again if the write fails.
    fn register(
        &self,
        mut payload: Value,
        id: Option<u64>,
    ) -> EngineResult<(u64, oneshot::Receiver<EngineResult<Value>>)> {
        let Value::Object(ref mut body) = payload else {
            return Err(EngineError::Protocol("request must be a JSON object".to_string()));
        };

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.lock();
            let id = match id {
                Some(id) if pending.contains_key(&id) => {
                    return Err(EngineError::DuplicateCorrelation(id));
                }
                Some(id) => id,
                None => self.allocate_id(&pending),
            };
            pending.insert(
                id,
                PendingRequest {
                    issued_at: Instant::now(),
                    slot: tx,
                },
            );
            id
        };

        body.insert(REQ_ID.to_string(), Value::from(id));
        if let Err(e) = self.transport.send(payload.to_string()) {
            self.lock().remove(&id);
            return Err(e);
        }

        Ok((id, rx))
    }

    /// Offer an inbound frame to the table.
    ///
    /// Returns the frame back when it matches no pending entry so the caller
    /// can route it as a push. A matching frame resolves (or, when it
    /// carries an error object, rejects) its waiter and is consumed.
    pub fn claim(&self, frame: Value) -> Option<Value> {
        let Some(id) = frame::req_id(&frame) else {
            return Some(frame);
        };

        let Some(entry) = self.lock().remove(&id) else {
            return Some(frame);
        };

        let result = match frame::remote_error(&frame) {
            Some(err) => Err(err),
            None => Ok(frame),
        };
        // Waiter may have given up already; nothing to do then
        let _ = entry.slot.send(result);
        None
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    /// Reject every outstanding waiter with `err`.
    pub fn fail_all(&self, err: EngineError) {
        let drained: Vec<(u64, PendingRequest)> = self.lock().drain().collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), error = %err, "Failing outstanding requests");
        }
        for (_, entry) in drained {
            let _ = entry.slot.send(Err(err.clone()));
        }
    }
}
