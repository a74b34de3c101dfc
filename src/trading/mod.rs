//! Trading: the run/stop trade cycle controller.

mod controller;

pub use controller::{RunState, RunSummary, TradeCycleController};
