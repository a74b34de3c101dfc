//! Trade cycle controller: authorize, purchase, monitor until settlement,
//! optionally repeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{BuyReceipt, BuyRequest};
use crate::error::{EngineError, EngineResult};
use crate::models::{Contract, ContractEvent, StreamEvent, TradeIntent};
use crate::session::{Session, SubscriptionKind};

const STATE_CHANNEL_CAPACITY: usize = 64;

/// Controller state. `Idle` is initial; `Stopped` ends a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Authorizing,
    Purchasing,
    Monitoring,
    Stopping,
    Stopped,
}

/// Outcome of one `run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub purchased: u32,
    pub settled: u32,
    pub wins: u32,
    pub losses: u32,
    pub net_profit: Decimal,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            purchased: 0,
            settled: 0,
            wins: 0,
            losses: 0,
            net_profit: Decimal::ZERO,
        }
    }

    fn record(&mut self, contract: &Contract) {
        self.settled += 1;
        if contract.is_win() {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.net_profit += contract.profit.unwrap_or(Decimal::ZERO);
    }
}

/// How a run's cycle loop ended without error.
enum Exit {
    /// Single trade settled
    Completed,
    /// `stop()` observed
    Stopped,
}

/// Clears the running flag however `run` exits, including when its future
/// is dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives purchase/monitor cycles on one session.
pub struct TradeCycleController {
    session: Arc<Session>,
    state: Mutex<RunState>,
    state_tx: broadcast::Sender<RunState>,
    stop_tx: watch::Sender<bool>,
    running: AtomicBool,
    min_cycle_delay: Duration,
}

impl TradeCycleController {
    pub fn new(session: Arc<Session>) -> Self {
        let min_cycle_delay = session.config().min_cycle_delay;
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        Self {
            session,
            state: Mutex::new(RunState::Idle),
            state_tx,
            stop_tx,
            running: AtomicBool::new(false),
            min_cycle_delay,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> RunState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receiver of every state change from now on.
    pub fn subscribe_state(&self) -> broadcast::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the current run to stop at its next transition boundary. A
    /// purchase already in flight completes; no further purchase is issued.
    /// Returns false if no run is active.
    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        info!(state = ?self.state(), "Stop requested");
        self.stop_tx.send_replace(true);
        true
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn set_state(&self, next: RunState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == next {
            return;
        }
        debug!(from = ?*state, to = ?next, "Run state");
        *state = next;
        drop(state);
        let _ = self.state_tx.send(next);
    }

    /// Run one trade, or repeat until stopped when `repeat` is set.
    ///
    /// An invalid intent or a second concurrent run fails with
    /// `PurchaseFailed` before any transition. A failed purchase of a single
    /// trade returns the controller to `Idle`; every other exit ends in
    /// `Stopped`.
    pub async fn run(&self, intent: TradeIntent, repeat: bool) -> EngineResult<RunSummary> {
        intent.validate()?;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::purchase("AlreadyRunning"));
        }
        let _guard = RunGuard(&self.running);

        self.stop_tx.send_replace(false);
        self.set_state(RunState::Idle);

        let mut summary = RunSummary::new();
        info!(
            run_id = %summary.run_id,
            symbol = %intent.symbol,
            kind = %intent.kind,
            stake = %intent.stake,
            repeat,
            "Run started"
        );

        let result = self.drive(&intent, repeat, &mut summary).await;

        match result {
            Ok(exit) => {
                if matches!(exit, Exit::Stopped) {
                    info!(run_id = %summary.run_id, "Run stopped on request");
                }
                self.set_state(RunState::Stopped);
                info!(
                    run_id = %summary.run_id,
                    purchased = summary.purchased,
                    settled = summary.settled,
                    wins = summary.wins,
                    losses = summary.losses,
                    net_profit = %summary.net_profit,
                    "Run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                let single_purchase_failure =
                    !repeat && matches!(e, EngineError::PurchaseFailed { .. });
                self.set_state(if single_purchase_failure {
                    RunState::Idle
                } else {
                    RunState::Stopped
                });
                warn!(
                    run_id = %summary.run_id,
                    purchased = summary.purchased,
                    settled = summary.settled,
                    error = %e,
                    "Run failed"
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        intent: &TradeIntent,
        repeat: bool,
        summary: &mut RunSummary,
    ) -> EngineResult<Exit> {
        self.set_state(RunState::Authorizing);
        let auth = self.session.ensure_authenticated().await?;
        if auth.currency.is_empty() {
            return Err(EngineError::AuthenticationFailed {
                reason: format!("account {} has no currency set", auth.login_id),
            });
        }

        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if self.stop_requested() {
                self.set_state(RunState::Stopping);
                return Ok(Exit::Stopped);
            }

            self.set_state(RunState::Purchasing);
            let receipt = self.purchase(intent, &auth.currency).await?;
            summary.purchased += 1;
            info!(
                contract_id = receipt.contract_id,
                transaction_id = receipt.transaction_id,
                buy_price = %receipt.buy_price,
                "Contract purchased"
            );

            let opened = ContractEvent::opened(&receipt, intent, &auth.currency);
            self.session.fanout().publish(&StreamEvent::Contract(opened));

            if self.stop_requested() {
                self.set_state(RunState::Stopping);
                return Ok(Exit::Stopped);
            }

            self.set_state(RunState::Monitoring);
            let mut contract = Contract::from_receipt(&receipt);
            let key = contract.contract_id.to_string();
            let mut handle = self.session.subscribe_contract(contract.contract_id).await?;

            let settled = loop {
                tokio::select! {
                    biased;
                    event = handle.next() => match event {
                        Some(StreamEvent::Contract(update)) => {
                            if contract.apply(&update) {
                                break true;
                            }
                        }
                        Some(StreamEvent::Tick(_)) => {}
                        None => {
                            // Cancelled underneath us: session teardown
                            return Err(if self.session.is_disposed() {
                                EngineError::SessionDisposed
                            } else {
                                EngineError::SubscriptionFailed {
                                    key: key.clone(),
                                    reason: "subscription closed before settlement".to_string(),
                                }
                            });
                        }
                    },
                    _ = stop_signal(&mut stop_rx) => break false,
                }
            };

            if !settled {
                self.set_state(RunState::Stopping);
                self.session.cancel(SubscriptionKind::ContractLifecycle, &key);
                return Ok(Exit::Stopped);
            }

            summary.record(&contract);
            info!(
                contract_id = contract.contract_id,
                profit = ?contract.profit,
                win = contract.is_win(),
                "Contract settled"
            );
            // Already released on settlement; this only drops the entry
            self.session.cancel(SubscriptionKind::ContractLifecycle, &key);

            if !repeat {
                return Ok(Exit::Completed);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.min_cycle_delay) => {}
                _ = stop_signal(&mut stop_rx) => {}
            }
        }
    }

    async fn purchase(&self, intent: &TradeIntent, currency: &str) -> EngineResult<BuyReceipt> {
        let request = BuyRequest::from_intent(intent, currency);
        let response = self.session.request(&request).await.map_err(|e| match e {
            EngineError::SessionDisposed => e,
            other => EngineError::purchase(other.reason()),
        })?;

        let body = response
            .get("buy")
            .cloned()
            .ok_or_else(|| EngineError::purchase("response has no buy body"))?;
        serde_json::from_value(body)
            .map_err(|e| EngineError::purchase(format!("malformed buy response: {}", e)))
    }
}

/// Resolves once a stop has been requested.
async fn stop_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{ContractKind, ContractStatus, DurationUnit};
    use crate::session::testing::{test_config, MockServer};
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    fn intent() -> TradeIntent {
        TradeIntent {
            kind: ContractKind::DigitEven,
            stake: dec!(1),
            duration: 5,
            duration_unit: DurationUnit::Ticks,
            symbol: "R_100".to_string(),
            prediction: None,
        }
    }

    fn buy_ok(server: &MockServer, request: &Value, contract_id: u64) {
        server.reply(
            request,
            "buy",
            json!({
                "contract_id": contract_id,
                "transaction_id": contract_id * 10,
                "buy_price": 1,
                "longcode": "Win payout if the last digit is even.",
                "start_time": 1700000000
            }),
        );
    }

    fn poc_ack(server: &MockServer, request: &Value, contract_id: u64) {
        server.send(json!({
            "req_id": request["req_id"],
            "msg_type": "proposal_open_contract",
            "proposal_open_contract": {"contract_id": contract_id, "is_sold": 0, "status": "open"},
            "subscription": {"id": format!("poc-{}", contract_id)}
        }));
    }

    fn poc_sold(server: &MockServer, contract_id: u64, profit: f64) {
        server.send(json!({
            "msg_type": "proposal_open_contract",
            "proposal_open_contract": {
                "contract_id": contract_id,
                "transaction_ids": {"buy": contract_id * 10, "sell": contract_id * 10 + 1},
                "buy_price": 1,
                "currency": "USD",
                "contract_type": "DIGITEVEN",
                "underlying": "R_100",
                "is_sold": 1,
                "status": if profit > 0.0 { "won" } else { "lost" },
                "profit": profit
            },
            "subscription": {"id": format!("poc-{}", contract_id)}
        }));
    }

    fn drain_states(rx: &mut broadcast::Receiver<RunState>) -> Vec<RunState> {
        let mut states = Vec::new();
        while let Ok(state) = rx.try_recv() {
            states.push(state);
        }
        states
    }

    #[tokio::test]
    async fn test_single_trade_runs_to_settlement() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = Arc::new(TradeCycleController::new(Arc::clone(&session)));
        let mut states = controller.subscribe_state();
        let mut events = session.fanout().subscribe();

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), false).await }
        });

        let auth = server.recv().await;
        assert!(auth.get("authorize").is_some());
        server.authorize_ok(&auth);

        let buy = server.recv().await;
        assert_eq!(buy["parameters"]["contract_type"], json!("DIGITEVEN"));
        assert_eq!(buy["parameters"]["currency"], json!("USD"));
        assert_eq!(buy["parameters"]["duration_unit"], json!("t"));
        buy_ok(&server, &buy, 42);

        let poc = server.recv().await;
        assert_eq!(poc["contract_id"], json!(42));
        poc_ack(&server, &poc, 42);
        poc_sold(&server, 42, 0.95);

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.purchased, 1);
        assert_eq!(summary.settled, 1);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.net_profit, dec!(0.95));

        assert_eq!(
            drain_states(&mut states),
            vec![
                RunState::Authorizing,
                RunState::Purchasing,
                RunState::Monitoring,
                RunState::Stopped
            ]
        );
        assert_eq!(controller.state(), RunState::Stopped);

        let mut terminal = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StreamEvent::Contract(c) = event {
                if c.status == ContractStatus::Sold {
                    terminal.push(c);
                }
            }
        }
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].contract_id, 42);

        // Settlement released the stream exactly once
        let forget = server.recv().await;
        assert_eq!(forget["forget"], json!("poc-42"));
        assert!(server.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stop_while_monitoring() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = Arc::new(TradeCycleController::new(Arc::clone(&session)));
        let mut states = controller.subscribe_state();

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), true).await }
        });

        let auth = server.recv().await;
        server.authorize_ok(&auth);
        let buy = server.recv().await;
        buy_ok(&server, &buy, 7);
        let poc = server.recv().await;
        poc_ack(&server, &poc, 7);

        while states.recv().await.unwrap() != RunState::Monitoring {}
        assert!(controller.stop());

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.purchased, 1);
        assert_eq!(summary.settled, 0);
        assert_eq!(controller.state(), RunState::Stopped);
        assert!(drain_states(&mut states).contains(&RunState::Stopping));

        let forget = server.recv().await;
        assert_eq!(forget["forget"], json!("poc-7"));
        assert!(!session
            .subscriptions()
            .is_active(SubscriptionKind::ContractLifecycle, "7"));

        // A late settlement changes nothing and triggers no purchase
        poc_sold(&server, 7, 0.95);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.try_recv().is_none());
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_repeat_waits_for_settlement_between_purchases() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = Arc::new(TradeCycleController::new(Arc::clone(&session)));

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), true).await }
        });

        let auth = server.recv().await;
        server.authorize_ok(&auth);

        for contract_id in [100u64, 101] {
            let buy = server.recv_skipping_forget().await;
            assert!(buy.get("buy").is_some());
            buy_ok(&server, &buy, contract_id);

            let poc = server.recv_skipping_forget().await;
            poc_ack(&server, &poc, contract_id);

            // Nothing else goes out before settlement
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(server.try_recv().is_none());

            let profit = if contract_id == 100 { 0.95 } else { -1.0 };
            poc_sold(&server, contract_id, profit);
        }

        // Third purchase is in flight; stop before answering it
        let buy = server.recv_skipping_forget().await;
        controller.stop();
        buy_ok(&server, &buy, 102);

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.purchased, 3);
        assert_eq!(summary.settled, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 1);
        assert_eq!(summary.net_profit, dec!(-0.05));
        assert_eq!(controller.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_cycle_delay_passes_through_stopping() {
        let config = EngineConfig {
            min_cycle_delay: Duration::from_secs(30),
            ..test_config()
        };
        let (session, mut server) = MockServer::start(config);
        let controller = Arc::new(TradeCycleController::new(Arc::clone(&session)));
        let mut states = controller.subscribe_state();

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), true).await }
        });

        let auth = server.recv().await;
        server.authorize_ok(&auth);
        let buy = server.recv().await;
        buy_ok(&server, &buy, 31);
        let poc = server.recv().await;
        poc_ack(&server, &poc, 31);
        poc_sold(&server, 31, 0.95);

        // Settlement releases the stream; the controller is now pacing
        let forget = server.recv().await;
        assert_eq!(forget["forget"], json!("poc-31"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(controller.stop());

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.purchased, 1);
        assert_eq!(summary.settled, 1);
        assert_eq!(
            drain_states(&mut states),
            vec![
                RunState::Authorizing,
                RunState::Purchasing,
                RunState::Monitoring,
                RunState::Stopping,
                RunState::Stopped
            ]
        );
        assert!(server.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_stops_run() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = Arc::new(TradeCycleController::new(session));

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), true).await }
        });
        let auth = server.recv().await;
        server.reply_error(&auth, "InvalidToken", "The token is invalid.");

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            EngineError::AuthenticationFailed {
                reason: "The token is invalid.".to_string()
            }
        );
        assert_eq!(controller.state(), RunState::Stopped);
        assert!(server.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_single_purchase_failure_returns_to_idle() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = Arc::new(TradeCycleController::new(session));

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), false).await }
        });
        let auth = server.recv().await;
        server.authorize_ok(&auth);
        let buy = server.recv().await;
        server.reply_error(&buy, "InsufficientBalance", "Your account balance is insufficient.");

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err, EngineError::purchase("Your account balance is insufficient."));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_repeat_purchase_failure_stops() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = Arc::new(TradeCycleController::new(session));

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), true).await }
        });
        let auth = server.recv().await;
        server.authorize_ok(&auth);
        let buy = server.recv().await;
        server.reply_error(&buy, "MarketIsClosed", "This market is presently closed.");

        assert!(run.await.unwrap().is_err());
        assert_eq!(controller.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = Arc::new(TradeCycleController::new(session));

        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), false).await }
        });
        let auth = server.recv().await;

        assert_eq!(
            controller.run(intent(), false).await.unwrap_err(),
            EngineError::purchase("AlreadyRunning")
        );

        server.authorize_ok(&auth);
        let buy = server.recv().await;
        buy_ok(&server, &buy, 9);
        let poc = server.recv().await;
        poc_ack(&server, &poc, 9);
        poc_sold(&server, 9, -1.0);
        assert_eq!(run.await.unwrap().unwrap().losses, 1);

        // A fresh run is allowed once the first one ended; auth is cached
        let again = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(intent(), false).await }
        });
        let next = server.recv_skipping_forget().await;
        assert!(next.get("buy").is_some());
        server.reply_error(&next, "RateLimit", "Too many requests");
        assert!(again.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_invalid_intent_has_no_transition() {
        let (session, mut server) = MockServer::start(test_config());
        let controller = TradeCycleController::new(session);
        let mut states = controller.subscribe_state();

        let mut bad = intent();
        bad.kind = ContractKind::DigitOver;
        assert!(matches!(
            controller.run(bad, false).await,
            Err(EngineError::PurchaseFailed { .. })
        ));
        assert!(drain_states(&mut states).is_empty());
        assert_eq!(controller.state(), RunState::Idle);
        assert!(server.try_recv().is_none());
        assert!(!controller.stop());
    }
}
