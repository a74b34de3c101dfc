//! Transport adapter: one message-oriented duplex channel per session.
//!
//! The session never touches the socket directly. It is handed a [`Duplex`]
//! (text frames out, text frames in) and treats the end of the inbound stream
//! as the closed signal. [`connect_websocket`] builds one over a real
//! WebSocket; tests use [`Duplex::pair`].

use std::sync::Mutex;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Lifecycle of the single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Both halves of a text-frame channel.
#[derive(Debug)]
pub struct Duplex {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// The far side of an in-memory [`Duplex`].
#[derive(Debug)]
pub struct DuplexPeer {
    /// Frames the session sent.
    pub requests: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the session. Dropping it closes the connection.
    pub responses: mpsc::UnboundedSender<String>,
}

impl Duplex {
    /// In-memory channel pair.
    pub fn pair() -> (Duplex, DuplexPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Duplex {
                outbound: out_tx,
                inbound: in_rx,
            },
            DuplexPeer {
                requests: out_rx,
                responses: in_tx,
            },
        )
    }
}

/// Open a WebSocket and pump its frames through a [`Duplex`].
///
/// Single attempt: no retry or backoff. The inbound channel ends when the
/// socket closes or errors.
pub async fn connect_websocket(url: &str, connect_timeout: Duration) -> EngineResult<Duplex> {
    info!(url = %url, "Connecting");

    let (ws_stream, _) = match tokio::time::timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => return Err(EngineError::ConnectFailed(e.to_string())),
        Err(_) => {
            return Err(EngineError::ConnectFailed(format!(
                "timed out after {:?}",
                connect_timeout
            )))
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    // Writer pump
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                warn!(error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = write.close().await;
        debug!("Writer pump finished");
    });

    // Reader pump
    tokio::spawn(async move {
        while let Some(message) = read.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    info!(?frame, "WebSocket closed by server");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "WebSocket read failed");
                    break;
                }
            };
            if in_tx.send(text).is_err() {
                break;
            }
        }
        debug!("Reader pump finished");
    });

    Ok(Duplex {
        outbound: out_tx,
        inbound: in_rx,
    })
}

/// Send half of the connection plus its lifecycle signal.
pub struct Transport {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: watch::Sender<ConnectionState>,
}

impl Transport {
    /// Wrap the outbound half of a duplex. Starts in `Connecting` until the
    /// receive loop is running.
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            outbound: Mutex::new(Some(outbound)),
            state,
        }
    }

    /// Queue a frame for sending. Fails fast once closed.
    pub fn send(&self, frame: String) -> EngineResult<()> {
        let guard = self.outbound.lock().map_err(|_| EngineError::NotConnected)?;
        let sender = guard.as_ref().ok_or(EngineError::NotConnected)?;
        sender.send(frame).map_err(|_| EngineError::NotConnected)
    }

    pub(crate) fn mark_open(&self) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Open;
                true
            } else {
                false
            }
        });
    }

    /// Mark the connection closed and drop the outbound half. Idempotent.
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let taken = match self.outbound.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.state.send_replace(ConnectionState::Closed);
        taken.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Resolves once the connection is closed (immediately if it already is).
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}
