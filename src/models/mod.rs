//! Data models for trade intents, contracts, accounts and stream events.

mod account;
mod contract;
mod event;
mod intent;

pub use account::{select_account, Account, AuthState};
pub use contract::{Contract, ContractStatus};
pub use event::{last_digit, ContractEvent, StreamEvent, TickEvent};
pub use intent::{ContractKind, DurationUnit, TradeIntent};
