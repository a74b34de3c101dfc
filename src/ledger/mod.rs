//! Transaction ledger: SQLite store of purchased contracts.
//!
//! Receives contract lifecycle events through [`LedgerSink`], which the
//! binary registers on the session's fan-out. A contract row that reached
//! `sold` is never reverted by a later `open` event.
//!
//! Stopping a run while it monitors a contract releases that contract's
//! stream, so its settlement never arrives here and the row stays `open`.
//! The contract still settles server-side.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rust_decimal::prelude::ToPrimitive;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{ContractEvent, ContractStatus, StreamEvent};
use crate::session::EventSink;

/// SQLite-backed contract ledger.
pub struct Ledger {
    pool: SqlitePool,
}

/// Stored contract row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerEntry {
    pub contract_id: i64,
    pub buy_transaction_id: Option<i64>,
    pub sell_transaction_id: Option<i64>,
    pub contract_type: String,
    pub underlying: String,
    pub currency: String,
    pub buy_price: Option<f64>,
    pub status: String,
    pub profit: Option<f64>,
    pub date_start: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl LedgerEntry {
    pub fn is_sold(&self) -> bool {
        self.status == ContractStatus::Sold.as_str()
    }
}

/// Aggregate over all stored contracts.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSummary {
    pub contracts: i64,
    pub settled: i64,
    pub wins: i64,
    pub losses: i64,
    pub net_profit: f64,
}

impl Ledger {
    /// Connect and create the schema if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to ledger database")?;

        let ledger = Self { pool };
        ledger.run_migrations().await?;

        Ok(ledger)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contracts (
                contract_id INTEGER PRIMARY KEY,
                buy_transaction_id INTEGER,
                sell_transaction_id INTEGER,
                contract_type TEXT NOT NULL DEFAULT '',
                underlying TEXT NOT NULL DEFAULT '',
                currency TEXT NOT NULL DEFAULT '',
                buy_price REAL,
                status TEXT NOT NULL,
                profit REAL,
                date_start INTEGER,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create contracts table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_contracts_updated ON contracts(updated_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert or update a contract from a lifecycle event. Returns false when
    /// the row was already sold and the event changed nothing.
    pub async fn record(&self, event: &ContractEvent) -> Result<bool> {
        let contract_id =
            i64::try_from(event.contract_id).context("contract id does not fit in i64")?;

        let result = sqlx::query(
            r#"
            INSERT INTO contracts (
                contract_id, buy_transaction_id, sell_transaction_id, contract_type,
                underlying, currency, buy_price, status, profit, date_start
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(contract_id) DO UPDATE SET
                buy_transaction_id = COALESCE(contracts.buy_transaction_id, excluded.buy_transaction_id),
                sell_transaction_id = COALESCE(excluded.sell_transaction_id, contracts.sell_transaction_id),
                contract_type = CASE WHEN excluded.contract_type = '' THEN contracts.contract_type ELSE excluded.contract_type END,
                underlying = CASE WHEN excluded.underlying = '' THEN contracts.underlying ELSE excluded.underlying END,
                currency = CASE WHEN excluded.currency = '' THEN contracts.currency ELSE excluded.currency END,
                buy_price = COALESCE(excluded.buy_price, contracts.buy_price),
                status = excluded.status,
                profit = COALESCE(excluded.profit, contracts.profit),
                date_start = COALESCE(contracts.date_start, excluded.date_start),
                updated_at = datetime('now')
            WHERE contracts.status != 'sold'
            "#,
        )
        .bind(contract_id)
        .bind(event.transaction_ids.buy.and_then(|id| i64::try_from(id).ok()))
        .bind(event.transaction_ids.sell.and_then(|id| i64::try_from(id).ok()))
        .bind(&event.contract_type)
        .bind(&event.underlying)
        .bind(&event.currency)
        .bind(event.buy_price.and_then(|p| p.to_f64()))
        .bind(event.status.as_str())
        .bind(event.profit.and_then(|p| p.to_f64()))
        .bind(event.date_start)
        .execute(&self.pool)
        .await
        .context("Failed to record contract")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, contract_id: u64) -> Result<Option<LedgerEntry>> {
        let contract_id = i64::try_from(contract_id).context("contract id does not fit in i64")?;
        sqlx::query_as::<_, LedgerEntry>("SELECT * FROM contracts WHERE contract_id = ?")
            .bind(contract_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch contract")
    }

    /// Most recently updated contracts first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<LedgerEntry>> {
        sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM contracts ORDER BY updated_at DESC, contract_id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch contracts")
    }

    pub async fn summary(&self) -> Result<LedgerSummary> {
        let (contracts, settled, wins, losses, net_profit): (i64, i64, i64, i64, f64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'sold' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'sold' AND profit > 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'sold' AND COALESCE(profit, 0) <= 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'sold' THEN COALESCE(profit, 0.0) ELSE 0.0 END), 0.0)
                FROM contracts
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .context("Failed to summarize contracts")?;

        Ok(LedgerSummary {
            contracts,
            settled,
            wins,
            losses,
            net_profit,
        })
    }
}

/// Fan-out sink that queues contract events for a background writer, so
/// the receive path never waits on the database.
pub struct LedgerSink {
    tx: mpsc::UnboundedSender<ContractEvent>,
}

impl LedgerSink {
    /// Start the writer task. It finishes once the sink is dropped and the
    /// queue is drained.
    pub fn spawn(ledger: Arc<Ledger>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ContractEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match ledger.record(&event).await {
                    Ok(true) => debug!(
                        contract_id = event.contract_id,
                        status = event.status.as_str(),
                        "Ledger updated"
                    ),
                    Ok(false) => debug!(contract_id = event.contract_id, "Ledger row already sold"),
                    Err(e) => warn!(contract_id = event.contract_id, error = %e, "Ledger write failed"),
                }
            }
        });

        (Self { tx }, writer)
    }
}

impl EventSink for LedgerSink {
    fn on_event(&self, event: &StreamEvent) -> Result<()> {
        if let StreamEvent::Contract(contract) = event {
            self.tx
                .send(contract.clone())
                .map_err(|_| anyhow!("ledger writer has stopped"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TransactionIds;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn event(contract_id: u64, status: ContractStatus, profit: Option<Decimal>) -> ContractEvent {
        ContractEvent {
            contract_id,
            transaction_ids: TransactionIds {
                buy: Some(contract_id * 10),
                sell: (status == ContractStatus::Sold).then_some(contract_id * 10 + 1),
            },
            buy_price: Some(dec!(1)),
            currency: "USD".to_string(),
            contract_type: "DIGITEVEN".to_string(),
            underlying: "R_100".to_string(),
            status,
            profit,
            date_start: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_sold_is_never_reverted() {
        let ledger = Ledger::new("sqlite::memory:").await.unwrap();

        assert!(ledger.record(&event(1, ContractStatus::Open, None)).await.unwrap());
        assert!(ledger
            .record(&event(1, ContractStatus::Open, Some(dec!(0.3))))
            .await
            .unwrap());
        assert!(ledger
            .record(&event(1, ContractStatus::Sold, Some(dec!(0.95))))
            .await
            .unwrap());
        assert!(!ledger
            .record(&event(1, ContractStatus::Open, Some(dec!(-1))))
            .await
            .unwrap());

        let row = ledger.get(1).await.unwrap().unwrap();
        assert!(row.is_sold());
        assert_eq!(row.profit, Some(0.95));
        assert_eq!(row.buy_transaction_id, Some(10));
        assert_eq!(row.sell_transaction_id, Some(11));
    }

    #[tokio::test]
    async fn test_summary_and_recent() {
        let ledger = Ledger::new("sqlite::memory:").await.unwrap();

        ledger.record(&event(1, ContractStatus::Sold, Some(dec!(0.95)))).await.unwrap();
        ledger.record(&event(2, ContractStatus::Sold, Some(dec!(-1)))).await.unwrap();
        ledger.record(&event(3, ContractStatus::Open, None)).await.unwrap();

        let summary = ledger.summary().await.unwrap();
        assert_eq!(summary.contracts, 3);
        assert_eq!(summary.settled, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 1);
        assert!((summary.net_profit - (-0.05)).abs() < 1e-9);

        let rows = ledger.recent(2).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_sink_writes_in_background() {
        let ledger = Arc::new(Ledger::new("sqlite::memory:").await.unwrap());
        let (sink, writer) = LedgerSink::spawn(Arc::clone(&ledger));

        assert_ok!(sink.on_event(&StreamEvent::Contract(event(5, ContractStatus::Open, None))));
        assert_ok!(sink.on_event(&StreamEvent::Contract(event(
            5,
            ContractStatus::Sold,
            Some(dec!(0.5))
        ))));

        drop(sink);
        writer.await.unwrap();

        let row = ledger.get(5).await.unwrap().unwrap();
        assert!(row.is_sold());
    }

    #[tokio::test]
    async fn test_sink_reports_stopped_writer() {
        let ledger = Arc::new(Ledger::new("sqlite::memory:").await.unwrap());
        let (sink, writer) = LedgerSink::spawn(ledger);
        writer.abort();
        let _ = writer.await;

        assert_err!(sink.on_event(&StreamEvent::Contract(event(6, ContractStatus::Open, None))));
    }
}
