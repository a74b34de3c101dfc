//! Purchased contract tracked from purchase to settlement.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::BuyReceipt;

use super::ContractEvent;

/// Lifecycle status of a contract. `Sold` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractStatus {
    Open,
    Sold,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Open => "open",
            ContractStatus::Sold => "sold",
        }
    }
}

/// One purchased contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: u64,
    pub transaction_id: u64,
    pub buy_price: Decimal,
    pub status: ContractStatus,
    /// Final profit once sold, latest indicative profit while open
    pub profit: Option<Decimal>,
    pub sell_transaction_id: Option<u64>,
}

impl Contract {
    pub fn from_receipt(receipt: &BuyReceipt) -> Self {
        Self {
            contract_id: receipt.contract_id,
            transaction_id: receipt.transaction_id,
            buy_price: receipt.buy_price,
            status: ContractStatus::Open,
            profit: None,
            sell_transaction_id: None,
        }
    }

    /// Apply a lifecycle update. Returns true only on the Open -> Sold
    /// transition; updates for other contracts or after Sold are ignored.
    pub fn apply(&mut self, update: &ContractEvent) -> bool {
        if update.contract_id != self.contract_id || self.is_settled() {
            return false;
        }

        if update.profit.is_some() {
            self.profit = update.profit;
        }

        if update.status == ContractStatus::Sold {
            self.status = ContractStatus::Sold;
            self.sell_transaction_id = update.transaction_ids.sell;
            return true;
        }

        false
    }

    pub fn is_settled(&self) -> bool {
        self.status == ContractStatus::Sold
    }

    pub fn is_win(&self) -> bool {
        self.is_settled() && self.profit.map_or(false, |p| p > Decimal::ZERO)
    }
}
