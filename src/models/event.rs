//! Events delivered to fan-out collaborators.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::api::{BuyReceipt, OpenContractPayload, TickPayload, TransactionIds};

use super::{ContractStatus, TradeIntent};

/// A parsed push event, either a price tick or a contract lifecycle update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    Tick(TickEvent),
    Contract(ContractEvent),
}

impl StreamEvent {
    /// Settlement of a contract.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Contract(c) if c.status == ContractStatus::Sold)
    }
}

/// Price tick with its derived last digit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickEvent {
    pub symbol: String,
    pub quote: Decimal,
    pub epoch: i64,
    pub pip_size: Option<u32>,
    pub last_digit: u8,
}

impl TickEvent {
    pub fn from_payload(payload: &TickPayload) -> Self {
        Self {
            symbol: payload.symbol.clone(),
            quote: payload.quote,
            epoch: payload.epoch,
            pip_size: payload.pip_size,
            last_digit: last_digit(payload.quote),
        }
    }
}

/// Last digit of a quote in its shortest form. Trailing zeros are dropped,
/// so `pip_size` padding never yields a spurious 0.
pub fn last_digit(quote: Decimal) -> u8 {
    quote
        .normalize()
        .to_string()
        .chars()
        .rev()
        .find_map(|c| c.to_digit(10))
        .unwrap_or(0) as u8
}

/// Contract lifecycle event, in the shape the transaction ledger consumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractEvent {
    pub contract_id: u64,
    pub transaction_ids: TransactionIds,
    pub buy_price: Option<Decimal>,
    pub currency: String,
    pub contract_type: String,
    pub underlying: String,
    pub status: ContractStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_start: Option<i64>,
}

impl ContractEvent {
    pub fn from_payload(payload: &OpenContractPayload) -> Self {
        let status = if payload.is_settled() {
            ContractStatus::Sold
        } else {
            ContractStatus::Open
        };

        Self {
            contract_id: payload.contract_id,
            transaction_ids: payload.transaction_ids.clone(),
            buy_price: payload.buy_price,
            currency: payload.currency.clone(),
            contract_type: payload.contract_type.clone(),
            underlying: payload.underlying.clone(),
            status,
            profit: payload.profit,
            date_start: payload.date_start,
        }
    }

    /// Event announcing a contract right after purchase.
    pub fn opened(receipt: &BuyReceipt, intent: &TradeIntent, currency: &str) -> Self {
        Self {
            contract_id: receipt.contract_id,
            transaction_ids: TransactionIds {
                buy: Some(receipt.transaction_id),
                sell: None,
            },
            buy_price: Some(receipt.buy_price),
            currency: currency.to_string(),
            contract_type: intent.kind.as_str().to_string(),
            underlying: intent.symbol.clone(),
            status: ContractStatus::Open,
            profit: None,
            date_start: receipt.start_time,
        }
    }
}
