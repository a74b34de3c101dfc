//! Tick analysis collaborators.

mod digits;

pub use digits::{DigitStats, DigitTracker, DEFAULT_WINDOW, RECENT_DIGITS};
