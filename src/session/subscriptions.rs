//! Subscription registry: routes push frames to their subscription by
//! semantic key (tick symbol, contract id).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::correlation::CorrelationTable;
use super::fanout::EventFanout;
use crate::api::frame;
use crate::api::{ForgetRequest, OpenContractPayload, TickPayload};
use crate::error::{EngineError, EngineResult};
use crate::models::{ContractEvent, StreamEvent, TickEvent};

/// Push stream kinds the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Tick,
    ContractLifecycle,
}

impl SubscriptionKind {
    /// `msg_type` of the pushes, which is also the body field name.
    pub fn msg_type(&self) -> &'static str {
        match self {
            SubscriptionKind::Tick => "tick",
            SubscriptionKind::ContractLifecycle => "proposal_open_contract",
        }
    }

    fn key_field(&self) -> &'static str {
        match self {
            SubscriptionKind::Tick => "symbol",
            SubscriptionKind::ContractLifecycle => "contract_id",
        }
    }

    pub fn of_frame(frame: &Value) -> Option<Self> {
        match frame::msg_type(frame)? {
            "tick" => Some(SubscriptionKind::Tick),
            "proposal_open_contract" => Some(SubscriptionKind::ContractLifecycle),
            _ => None,
        }
    }

    /// Semantic key carried by a push of this kind.
    pub fn key_of(&self, frame: &Value) -> Option<String> {
        frame::key_string(frame.get(self.msg_type())?.get(self.key_field())?)
    }

    fn parse(&self, frame: &Value) -> EngineResult<StreamEvent> {
        let body = frame
            .get(self.msg_type())
            .cloned()
            .ok_or_else(|| EngineError::Protocol(format!("missing {} body", self.msg_type())))?;

        match self {
            SubscriptionKind::Tick => {
                let payload: TickPayload = serde_json::from_value(body)
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
                Ok(StreamEvent::Tick(TickEvent::from_payload(&payload)))
            }
            SubscriptionKind::ContractLifecycle => {
                let payload: OpenContractPayload = serde_json::from_value(body)
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
                Ok(StreamEvent::Contract(ContractEvent::from_payload(&payload)))
            }
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg_type())
    }
}

type SubscriptionKey = (SubscriptionKind, String);

/// One registered subscription.
struct Subscription {
    /// Assigned by the server; unknown until the ack or first push
    remote_id: Option<String>,
    active: bool,
    /// Distinguishes a re-subscription from the entry it replaced
    generation: u64,
    events: mpsc::UnboundedSender<StreamEvent>,
}

/// Receiving end of one subscription. Yields `None` once the subscription
/// is cancelled or the session is disposed.
#[derive(Debug)]
pub struct SubscriptionHandle {
    kind: SubscriptionKind,
    key: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

/// At most one active subscription per `(kind, key)`.
pub struct SubscriptionRegistry {
    correlation: Arc<CorrelationTable>,
    fanout: Arc<EventFanout>,
    entries: Mutex<HashMap<SubscriptionKey, Subscription>>,
    next_generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(correlation: Arc<CorrelationTable>, fanout: Arc<EventFanout>) -> Self {
        Self {
            correlation,
            fanout,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Subscription>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe and wait for the acknowledgement.
    ///
    /// The entry is registered under `key` before the request goes out, so
    /// pushes that race ahead of the acknowledgement are routed. An existing
    /// subscription for the same key is cancelled first.
    pub async fn subscribe(
        &self,
        request: Value,
        key: &str,
        kind: SubscriptionKind,
    ) -> EngineResult<SubscriptionHandle> {
        self.cancel(kind, key);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let map_key = (kind, key.to_string());
        self.lock().insert(
            map_key.clone(),
            Subscription {
                remote_id: None,
                active: true,
                generation,
                events: tx,
            },
        );

        let ack = match self.correlation.request(request).await {
            Ok(ack) => ack,
            Err(e) => {
                let mut entries = self.lock();
                if entries.get(&map_key).map(|s| s.generation) == Some(generation) {
                    entries.remove(&map_key);
                }
                drop(entries);

                if e == EngineError::SessionDisposed {
                    return Err(e);
                }
                return Err(EngineError::SubscriptionFailed {
                    key: key.to_string(),
                    reason: e.reason(),
                });
            }
        };

        let remote_id = frame::subscription_id(&ack);
        let still_registered = {
            let mut entries = self.lock();
            match entries.get_mut(&map_key) {
                Some(entry) if entry.generation == generation => {
                    if entry.remote_id.is_none() {
                        entry.remote_id = remote_id.clone();
                    }
                    true
                }
                _ => false,
            }
        };

        if !still_registered {
            // Cancelled while the request was in flight
            if let Some(id) = remote_id {
                self.forget(&id);
            }
            return Err(EngineError::SubscriptionFailed {
                key: key.to_string(),
                reason: "cancelled before acknowledgement".to_string(),
            });
        }

        info!(kind = %kind, key = %key, remote_id = ?remote_id, "Subscribed");
        Ok(SubscriptionHandle {
            kind,
            key: key.to_string(),
            events: rx,
        })
    }

    /// Route a push frame not claimed by the correlation table. Returns
    /// false (after logging a warning) when no active subscription matches.
    pub fn route(&self, frame: &Value) -> bool {
        self.deliver(frame, true)
    }

    /// Match a push to its subscription, forward it to the handle and the
    /// fan-out. A terminal lifecycle event deactivates the subscription and
    /// releases it on the server.
    pub(crate) fn deliver(&self, frame: &Value, warn_unmatched: bool) -> bool {
        let Some(kind) = SubscriptionKind::of_frame(frame) else {
            if warn_unmatched {
                warn!(msg_type = ?frame::msg_type(frame), "Dropping frame with unknown msg_type");
            }
            return false;
        };
        let Some(key) = kind.key_of(frame) else {
            warn!(kind = %kind, "Dropping push without a routing key");
            return false;
        };

        let event = match kind.parse(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = %kind, key = %key, error = %e, "Dropping malformed push");
                return false;
            }
        };

        let (events, forget) = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(&(kind, key.clone())) else {
                drop(entries);
                if warn_unmatched {
                    warn!(kind = %kind, key = %key, "Dropping push for unknown subscription");
                }
                return false;
            };
            if !entry.active {
                debug!(kind = %kind, key = %key, "Dropping push for inactive subscription");
                return false;
            }

            if entry.remote_id.is_none() {
                entry.remote_id = frame::subscription_id(frame);
            }

            let forget = if event.is_terminal() {
                entry.active = false;
                entry.remote_id.clone()
            } else {
                None
            };
            (entry.events.clone(), forget)
        };

        self.fanout.publish(&event);
        // Handle may already be gone; the fan-out still saw the event
        let _ = events.send(event);

        if let Some(id) = forget {
            debug!(key = %key, remote_id = %id, "Contract settled, releasing stream");
            self.forget(&id);
        }
        true
    }

    /// Cancel the subscription for `(kind, key)`.
    ///
    /// Issues a best-effort `forget` if the subscription was active and its
    /// remote id is known. Cancelling an unknown or inactive key is a no-op.
    /// Returns true if an active subscription was cancelled.
    pub fn cancel(&self, kind: SubscriptionKind, key: &str) -> bool {
        let Some(entry) = self.lock().remove(&(kind, key.to_string())) else {
            return false;
        };
        if !entry.active {
            return false;
        }

        info!(kind = %kind, key = %key, "Subscription cancelled");
        if let Some(id) = entry.remote_id {
            self.forget(&id);
        }
        true
    }

    /// Cancel everything. Used on session disposal.
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<(SubscriptionKey, Subscription)> = self.lock().drain().collect();
        let mut cancelled = 0;
        for ((kind, key), entry) in drained {
            if !entry.active {
                continue;
            }
            cancelled += 1;
            debug!(kind = %kind, key = %key, "Disposing subscription");
            if let Some(id) = entry.remote_id {
                self.forget(&id);
            }
        }
        cancelled
    }

    pub fn is_active(&self, kind: SubscriptionKind, key: &str) -> bool {
        self.lock()
            .get(&(kind, key.to_string()))
            .map_or(false, |entry| entry.active)
    }

    pub fn remote_id(&self, kind: SubscriptionKind, key: &str) -> Option<String> {
        self.lock()
            .get(&(kind, key.to_string()))
            .and_then(|entry| entry.remote_id.clone())
    }

    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|entry| entry.active).count()
    }

    fn forget(&self, remote_id: &str) {
        let request = ForgetRequest {
            forget: remote_id.to_string(),
        };
        let sent = serde_json::to_value(&request)
            .map_err(|e| EngineError::Protocol(e.to_string()))
            .and_then(|payload| self.correlation.send_detached(payload));
        if let Err(e) = sent {
            debug!(remote_id = %remote_id, error = %e, "Forget not sent");
        }
    }
}
