//! The connection: transport plus the two routing tables, and the receive
//! loop that feeds them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::correlation::CorrelationTable;
use super::fanout::EventFanout;
use super::subscriptions::{SubscriptionKind, SubscriptionRegistry};
use super::transport::Transport;
use crate::api::frame;

pub struct Connection {
    pub(crate) transport: Arc<Transport>,
    pub(crate) correlation: Arc<CorrelationTable>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) fanout: Arc<EventFanout>,
}

impl Connection {
    pub fn new(outbound: mpsc::UnboundedSender<String>, request_timeout: Duration) -> Self {
        let transport = Arc::new(Transport::new(outbound));
        let correlation = Arc::new(CorrelationTable::new(
            Arc::clone(&transport),
            request_timeout,
        ));
        let fanout = Arc::new(EventFanout::new());
        let subscriptions = SubscriptionRegistry::new(Arc::clone(&correlation), Arc::clone(&fanout));

        Self {
            transport,
            correlation,
            subscriptions,
            fanout,
        }
    }

    /// Route one inbound frame: correlation table first, then the
    /// subscription registry. Never fails; bad frames are logged and dropped.
    pub fn handle_frame(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        let push_kind = SubscriptionKind::of_frame(&frame);

        // A subscribe acknowledgement can carry the first snapshot; route it
        // before the waiter is released so the subscriber sees it first.
        if push_kind.is_some() && frame::remote_error(&frame).is_none() {
            if let Some(id) = frame::req_id(&frame) {
                if self.correlation.is_pending(id) {
                    self.subscriptions.deliver(&frame, false);
                }
            }
        }

        let Some(frame) = self.correlation.claim(frame) else {
            return;
        };

        if push_kind.is_some() {
            self.subscriptions.route(&frame);
        } else if let Some(id) = frame::req_id(&frame) {
            debug!(req_id = id, msg_type = ?frame::msg_type(&frame), "Dropping late response");
        } else {
            warn!(msg_type = ?frame::msg_type(&frame), "Dropping unroutable frame");
        }
    }
}

/// Drain inbound frames in arrival order until the stream ends or the
/// transport is closed locally, then run `on_closed` once and mark the
/// transport closed.
pub(crate) async fn receive_loop<F>(
    connection: Arc<Connection>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    on_closed: F,
) where
    F: FnOnce() + Send + 'static,
{
    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(text) => connection.handle_frame(&text),
                None => {
                    info!("Connection closed by peer");
                    break;
                }
            },
            _ = connection.transport.closed() => {
                debug!("Connection closed locally");
                break;
            }
        }
    }

    on_closed();
    connection.transport.close();
}
