//! Smart Trader session engine.
//!
//! One authenticated WebSocket connection to the Deriv API that multiplexes
//! request/response exchanges and push subscriptions, plus a run/stop
//! controller that buys short-duration contracts and follows each one to
//! settlement.

pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod session;
pub mod trading;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use session::Session;
pub use trading::{RunState, RunSummary, TradeCycleController};
