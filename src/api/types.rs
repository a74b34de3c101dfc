//! Request and response bodies for the Deriv WebSocket API (v3).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::frame::flag;
use crate::models::{Account, ContractKind, DurationUnit, TradeIntent};

/// Default public endpoint.
pub const WS_ENDPOINT: &str = "wss://ws.derivws.com/websockets/v3";

// ==================== Requests ====================

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest {
    pub authorize: String,
}

impl AuthorizeRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            authorize: token.into(),
        }
    }
}

/// Purchase request: `{buy: 1, price, parameters}`.
#[derive(Debug, Clone, Serialize)]
pub struct BuyRequest {
    pub buy: u8,
    /// Maximum price we accept to pay; equal to the stake.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub parameters: BuyParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyParameters {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub basis: String,
    pub contract_type: ContractKind,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    pub symbol: String,
    /// Prediction digit for digit contracts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier: Option<String>,
}

impl BuyRequest {
    /// Build a stake-basis purchase for the given intent in the account currency.
    pub fn from_intent(intent: &TradeIntent, currency: &str) -> Self {
        Self {
            buy: 1,
            price: intent.stake,
            parameters: BuyParameters {
                amount: intent.stake,
                basis: "stake".to_string(),
                contract_type: intent.kind,
                currency: currency.to_string(),
                duration: intent.duration,
                duration_unit: intent.duration_unit,
                symbol: intent.symbol.clone(),
                barrier: intent.prediction.map(|d| d.to_string()),
            },
        }
    }
}

/// Tick stream subscription.
#[derive(Debug, Clone, Serialize)]
pub struct TicksRequest {
    pub ticks: String,
    pub subscribe: u8,
}

impl TicksRequest {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            ticks: symbol.into(),
            subscribe: 1,
        }
    }
}

/// Contract lifecycle subscription for one purchased contract.
#[derive(Debug, Clone, Serialize)]
pub struct OpenContractRequest {
    pub proposal_open_contract: u8,
    pub contract_id: u64,
    pub subscribe: u8,
}

impl OpenContractRequest {
    pub fn new(contract_id: u64) -> Self {
        Self {
            proposal_open_contract: 1,
            contract_id,
            subscribe: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForgetRequest {
    pub forget: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSymbolsRequest {
    pub active_symbols: String,
}

impl Default for ActiveSymbolsRequest {
    fn default() -> Self {
        Self {
            active_symbols: "brief".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceRequest {
    pub balance: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loginid: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    pub ping: u8,
}

// ==================== Responses ====================

/// Body of an `authorize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub account_list: Vec<Account>,
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default, deserialize_with = "flag")]
    pub is_virtual: bool,
}

/// Body of a `buy` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BuyReceipt {
    pub contract_id: u64,
    pub transaction_id: u64,
    pub buy_price: Decimal,
    #[serde(default)]
    pub longcode: String,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub balance_after: Option<Decimal>,
}

/// Body of a `tick` push.
#[derive(Debug, Clone, Deserialize)]
pub struct TickPayload {
    pub symbol: String,
    pub quote: Decimal,
    #[serde(default)]
    pub epoch: i64,
    #[serde(default)]
    pub pip_size: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell: Option<u64>,
}

/// Body of a `proposal_open_contract` push.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenContractPayload {
    pub contract_id: u64,
    #[serde(default)]
    pub transaction_ids: TransactionIds,
    #[serde(default)]
    pub buy_price: Option<Decimal>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub underlying: String,
    #[serde(default, deserialize_with = "flag")]
    pub is_sold: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub date_start: Option<i64>,
}

impl OpenContractPayload {
    /// True once the contract has closed with a final profit or loss.
    pub fn is_settled(&self) -> bool {
        self.is_sold
            || matches!(
                self.status.as_deref(),
                Some("sold") | Some("won") | Some("lost")
            )
    }
}

/// One entry of an `active_symbols` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveSymbol {
    pub symbol: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub market_display_name: String,
    #[serde(default, deserialize_with = "flag")]
    pub exchange_is_open: bool,
}

impl ActiveSymbol {
    /// Synthetic (volatility) indices: the only markets open around the clock.
    pub fn is_synthetic(&self) -> bool {
        self.market.to_lowercase().contains("synthetic") || self.symbol.starts_with("R_")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceInfo {
    pub balance: Decimal,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub loginid: String,
}
