//! Session engine: one authenticated connection multiplexing requests and
//! push subscriptions.
//!
//! A [`Session`] owns its [`Connection`] (transport, correlation table,
//! subscription registry, fan-out) and its [`Authenticator`]. It is created
//! with [`Session::connect`] or [`Session::from_duplex`] and torn down with
//! [`Session::dispose`], which also runs when the transport reports closure.

mod auth;
mod connection;
mod correlation;
mod fanout;
mod subscriptions;
mod transport;

pub use auth::Authenticator;
pub use connection::Connection;
pub use correlation::CorrelationTable;
pub use fanout::{EventFanout, EventSink, SinkId};
pub use subscriptions::{SubscriptionHandle, SubscriptionKind, SubscriptionRegistry};
pub use transport::{connect_websocket, ConnectionState, Duplex, DuplexPeer, Transport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::api::{
    ActiveSymbol, ActiveSymbolsRequest, BalanceInfo, BalanceRequest, OpenContractRequest,
    PingRequest, TicksRequest,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::AuthState;

pub struct Session {
    config: EngineConfig,
    connection: Arc<Connection>,
    auth: Authenticator,
    disposed: AtomicBool,
}

impl Session {
    /// Open a WebSocket to `config.url()` and start a session on it.
    pub async fn connect(config: EngineConfig) -> EngineResult<Arc<Self>> {
        let duplex = connect_websocket(&config.url(), config.connect_timeout).await?;
        Ok(Self::from_duplex(duplex, config))
    }

    /// Start a session over an already-open duplex channel. Spawns the
    /// receive loop and, if configured, the keep-alive task.
    pub fn from_duplex(duplex: Duplex, config: EngineConfig) -> Arc<Self> {
        let Duplex { outbound, inbound } = duplex;
        let connection = Arc::new(Connection::new(outbound, config.request_timeout));
        let auth = Authenticator::new(
            Arc::clone(&connection.correlation),
            config.api_token.clone(),
        );

        let session = Arc::new(Self {
            config,
            connection: Arc::clone(&connection),
            auth,
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&session);
        tokio::spawn(connection::receive_loop(
            Arc::clone(&connection),
            inbound,
            move || {
                if let Some(session) = weak.upgrade() {
                    session.dispose();
                }
            },
        ));
        connection.transport.mark_open();

        if let Some(interval) = session.config.keepalive_interval {
            tokio::spawn(keepalive(Arc::downgrade(&session), interval));
        }

        session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Send a request and await its response frame.
    pub async fn request<T: Serialize>(&self, request: &T) -> EngineResult<Value> {
        if self.is_disposed() {
            return Err(EngineError::SessionDisposed);
        }
        let payload =
            serde_json::to_value(request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        self.connection.correlation.request(payload).await
    }

    /// Send a request with a caller-chosen correlation id.
    pub async fn request_with_id<T: Serialize>(&self, request: &T, id: u64) -> EngineResult<Value> {
        if self.is_disposed() {
            return Err(EngineError::SessionDisposed);
        }
        let payload =
            serde_json::to_value(request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        self.connection.correlation.send(payload, id).await
    }

    pub async fn ensure_authenticated(&self) -> EngineResult<AuthState> {
        self.auth.ensure_authenticated().await
    }

    pub fn auth_state(&self) -> Option<AuthState> {
        self.auth.current()
    }

    pub async fn subscribe<T: Serialize>(
        &self,
        request: &T,
        key: &str,
        kind: SubscriptionKind,
    ) -> EngineResult<SubscriptionHandle> {
        if self.is_disposed() {
            return Err(EngineError::SessionDisposed);
        }
        let payload =
            serde_json::to_value(request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        self.connection
            .subscriptions
            .subscribe(payload, key, kind)
            .await
    }

    pub async fn subscribe_ticks(&self, symbol: &str) -> EngineResult<SubscriptionHandle> {
        self.subscribe(&TicksRequest::new(symbol), symbol, SubscriptionKind::Tick)
            .await
    }

    pub async fn subscribe_contract(&self, contract_id: u64) -> EngineResult<SubscriptionHandle> {
        self.subscribe(
            &OpenContractRequest::new(contract_id),
            &contract_id.to_string(),
            SubscriptionKind::ContractLifecycle,
        )
        .await
    }

    /// Idempotent; returns true if an active subscription was cancelled.
    pub fn cancel(&self, kind: SubscriptionKind, key: &str) -> bool {
        self.connection.subscriptions.cancel(kind, key)
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.connection.subscriptions
    }

    pub fn fanout(&self) -> &Arc<EventFanout> {
        &self.connection.fanout
    }

    /// Symbols currently offered, restricted to synthetic indices.
    pub async fn active_symbols(&self) -> EngineResult<Vec<ActiveSymbol>> {
        let response = self.request(&ActiveSymbolsRequest::default()).await?;
        let symbols: Vec<ActiveSymbol> = body(&response, "active_symbols")?;
        Ok(symbols.into_iter().filter(ActiveSymbol::is_synthetic).collect())
    }

    /// Balance of the authorized account, or of `loginid` when given.
    pub async fn balance(&self, loginid: Option<&str>) -> EngineResult<BalanceInfo> {
        self.ensure_authenticated().await?;
        let request = BalanceRequest {
            balance: 1,
            loginid: loginid.map(str::to_string),
        };
        let response = self.request(&request).await?;
        body(&response, "balance")
    }

    pub async fn ping(&self) -> EngineResult<()> {
        self.request(&PingRequest { ping: 1 }).await.map(|_| ())
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.transport.state()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.connection.transport.closed().await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Cancel every subscription, fail every pending request with
    /// `SessionDisposed` and close the connection. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled = self.connection.subscriptions.dispose_all();
        self.connection
            .correlation
            .fail_all(EngineError::SessionDisposed);
        self.connection.transport.close();
        self.auth.dispose();

        info!(subscriptions = cancelled, "Session disposed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_disposed() {
            self.connection.transport.close();
            self.connection
                .correlation
                .fail_all(EngineError::SessionDisposed);
        }
    }
}

fn body<T: serde::de::DeserializeOwned>(response: &Value, field: &str) -> EngineResult<T> {
    let value = response
        .get(field)
        .cloned()
        .ok_or_else(|| EngineError::Protocol(format!("response has no {} body", field)))?;
    serde_json::from_value(value).map_err(|e| EngineError::Protocol(e.to_string()))
}

async fn keepalive(session: Weak<Session>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.is_disposed() {
            break;
        }
        let sent = serde_json::to_value(PingRequest { ping: 1 })
            .map_err(|e| EngineError::Protocol(e.to_string()))
            .and_then(|ping| session.connection.correlation.send_detached(ping));
        if let Err(e) = sent {
            debug!(error = %e, "Keep-alive ping not sent");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{test_config, MockServer};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_concurrent_requests_resolve_by_id() {
        let (session, mut server) = MockServer::start(test_config());

        let calls: Vec<_> = (0..5)
            .map(|i| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let response = session.request(&json!({"ping": 1, "n": i})).await.unwrap();
                    (i, response)
                })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(server.recv().await);
        }
        // Answer in reverse arrival order
        for request in requests.iter().rev() {
            server.reply(request, "ping", json!(format!("pong-{}", request["n"])));
        }

        for call in calls {
            let (i, response) = call.await.unwrap();
            assert_eq!(response["ping"], json!(format!("pong-{}", i)));
            assert_eq!(response["echo_req"]["n"], json!(i));
        }
    }

    #[tokio::test]
    async fn test_caller_chosen_duplicate_id() {
        let (session, mut server) = MockServer::start(test_config());

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request_with_id(&json!({"ping": 1}), 500).await }
        });
        let request = server.recv().await;

        let err = session
            .request_with_id(&json!({"ping": 1}), 500)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::DuplicateCorrelation(500));

        server.reply(&request, "ping", json!("pong"));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_auto_request_does_not_collide_with_held_id() {
        let (session, mut server) = MockServer::start(test_config());

        let held = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request_with_id(&json!({"ping": 1}), 1).await }
        });
        let held_request = server.recv().await;
        assert_eq!(held_request["req_id"], json!(1));

        let auto = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request(&json!({"ping": 1})).await }
        });
        let auto_request = server.recv().await;
        assert_ne!(auto_request["req_id"], json!(1));

        server.reply(&auto_request, "ping", json!("pong"));
        assert!(auto.await.unwrap().is_ok());

        server.reply(&held_request, "ping", json!("pong"));
        assert!(held.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_peer_close_disposes_session() {
        let (session, mut server) = MockServer::start(test_config());

        let ticks = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.subscribe_ticks("R_100").await }
        });
        let request = server.recv().await;
        server.send(json!({"req_id": request["req_id"], "msg_type": "tick", "subscription": {"id": "a"}}));
        let mut tick_handle = ticks.await.unwrap().unwrap();

        let contract = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.subscribe_contract(42).await }
        });
        let request = server.recv().await;
        server.send(json!({
            "req_id": request["req_id"],
            "msg_type": "proposal_open_contract",
            "subscription": {"id": "b"}
        }));
        let mut contract_handle = contract.await.unwrap().unwrap();
        assert_eq!(session.subscriptions().active_count(), 2);

        let pending = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request(&json!({"balance": 1})).await }
        });
        server.recv().await;

        server.hang_up();
        session.closed().await;

        assert_eq!(pending.await.unwrap(), Err(EngineError::SessionDisposed));
        assert!(session.is_disposed());
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(!session.subscriptions().is_active(SubscriptionKind::Tick, "R_100"));
        assert!(!session.subscriptions().is_active(SubscriptionKind::ContractLifecycle, "42"));
        assert!(tick_handle.next().await.is_none());
        assert!(contract_handle.next().await.is_none());

        assert_eq!(
            session.request(&json!({"ping": 1})).await,
            Err(EngineError::SessionDisposed)
        );
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (session, _server) = MockServer::start(test_config());
        session.dispose();
        session.dispose();
        assert!(session.is_disposed());
        assert_eq!(
            session.ensure_authenticated().await,
            Err(EngineError::SessionDisposed)
        );
    }

    #[tokio::test]
    async fn test_active_symbols_are_filtered() {
        let (session, mut server) = MockServer::start(test_config());

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.active_symbols().await }
        });
        let request = server.recv().await;
        assert_eq!(request["active_symbols"], json!("brief"));
        server.reply(
            &request,
            "active_symbols",
            json!([
                {"symbol": "R_100", "display_name": "Volatility 100 Index", "market": "synthetic_index"},
                {"symbol": "frxEURUSD", "display_name": "EUR/USD", "market": "forex"}
            ]),
        );

        let symbols = call.await.unwrap().unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].symbol, "R_100");
    }

    #[tokio::test]
    async fn test_balance_authorizes_first() {
        let (session, mut server) = MockServer::start(test_config());

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.balance(Some("CR300")).await }
        });

        let auth = server.recv().await;
        assert_eq!(auth["authorize"], json!("test-token"));
        server.authorize_ok(&auth);

        let request = server.recv().await;
        assert_eq!(request["loginid"], json!("CR300"));
        server.reply(
            &request,
            "balance",
            json!({"balance": 99.5, "currency": "USD", "loginid": "CR300"}),
        );

        let info = call.await.unwrap().unwrap();
        assert_eq!(info.balance, rust_decimal_macros::dec!(99.5));
        assert_eq!(
            session.auth_state().unwrap().real_fiat_account().unwrap().loginid,
            "CR300"
        );
    }
}
