//! Last-digit statistics for one tick stream.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::{StreamEvent, TickEvent};
use crate::session::EventSink;

/// Digits kept for the "recent digits" strip.
pub const RECENT_DIGITS: usize = 9;

/// Default sample size for frequency and percentage statistics.
pub const DEFAULT_WINDOW: usize = 1000;

#[derive(Debug, Default)]
struct DigitWindow {
    digits: VecDeque<u8>,
    quotes: VecDeque<Decimal>,
    processed: u64,
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigitStats {
    pub symbol: String,
    pub last_digit: Option<u8>,
    /// Oldest first, at most [`RECENT_DIGITS`]
    pub recent: Vec<u8>,
    pub processed: u64,
    pub sample_size: usize,
    /// Share of each digit 0-9 in the sample, in percent
    pub frequency: [f64; 10],
    pub even_percent: f64,
    pub odd_percent: f64,
    pub rise_percent: f64,
    pub fall_percent: f64,
}

/// Fan-out sink tracking the last digits of one symbol's ticks.
///
/// Every delivery counts; the same tick delivered twice is processed twice.
pub struct DigitTracker {
    symbol: String,
    window: usize,
    inner: Mutex<DigitWindow>,
}

impl DigitTracker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_window(symbol, DEFAULT_WINDOW)
    }

    pub fn with_window(symbol: impl Into<String>, window: usize) -> Self {
        Self {
            symbol: symbol.into(),
            window: window.max(RECENT_DIGITS),
            inner: Mutex::new(DigitWindow::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DigitWindow> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Record a tick. Ticks for other symbols are ignored (returns false).
    pub fn record(&self, tick: &TickEvent) -> bool {
        if tick.symbol != self.symbol {
            return false;
        }

        let mut inner = self.lock();
        inner.processed += 1;
        inner.digits.push_back(tick.last_digit);
        inner.quotes.push_back(tick.quote);
        while inner.digits.len() > self.window {
            inner.digits.pop_front();
        }
        while inner.quotes.len() > self.window {
            inner.quotes.pop_front();
        }
        true
    }

    pub fn last_digit(&self) -> Option<u8> {
        self.lock().digits.back().copied()
    }

    pub fn processed(&self) -> u64 {
        self.lock().processed
    }

    /// The most recent digits, oldest first.
    pub fn recent(&self) -> Vec<u8> {
        let inner = self.lock();
        let skip = inner.digits.len().saturating_sub(RECENT_DIGITS);
        inner.digits.iter().skip(skip).copied().collect()
    }

    /// Percentage of each digit in the sample.
    pub fn frequency(&self) -> [f64; 10] {
        let inner = self.lock();
        let mut counts = [0usize; 10];
        for &d in &inner.digits {
            counts[usize::from(d.min(9))] += 1;
        }
        let total = inner.digits.len();
        let mut pct = [0.0; 10];
        for (slot, count) in pct.iter_mut().zip(counts) {
            *slot = percent(count, total);
        }
        pct
    }

    /// (even %, odd %) of the sample.
    pub fn even_odd_percent(&self) -> (f64, f64) {
        self.split_percent(|d| d % 2 == 0, |d| d % 2 == 1)
    }

    /// (over %, under %) relative to `barrier`; digits equal to it count
    /// as neither.
    pub fn over_under_percent(&self, barrier: u8) -> (f64, f64) {
        self.split_percent(|d| d > barrier, |d| d < barrier)
    }

    /// (match %, differ %) for `digit`.
    pub fn match_diff_percent(&self, digit: u8) -> (f64, f64) {
        self.split_percent(|d| d == digit, |d| d != digit)
    }

    /// (rise %, fall %) over consecutive quote pairs; unchanged pairs count
    /// as neither.
    pub fn rise_fall_percent(&self) -> (f64, f64) {
        let inner = self.lock();
        let pairs = inner.quotes.len().saturating_sub(1);
        let (mut rises, mut falls) = (0, 0);
        for (prev, next) in inner.quotes.iter().zip(inner.quotes.iter().skip(1)) {
            if next > prev {
                rises += 1;
            } else if next < prev {
                falls += 1;
            }
        }
        (percent(rises, pairs), percent(falls, pairs))
    }

    /// True when the last `count` digits all satisfy `condition`. False if
    /// fewer than `count` digits have been seen.
    pub fn last_digits_all<F>(&self, count: usize, condition: F) -> bool
    where
        F: Fn(u8) -> bool,
    {
        let inner = self.lock();
        if count == 0 || inner.digits.len() < count {
            return false;
        }
        inner.digits.iter().rev().take(count).all(|&d| condition(d))
    }

    pub fn snapshot(&self) -> DigitStats {
        let frequency = self.frequency();
        let (even_percent, odd_percent) = self.even_odd_percent();
        let (rise_percent, fall_percent) = self.rise_fall_percent();
        let inner = self.lock();

        DigitStats {
            symbol: self.symbol.clone(),
            last_digit: inner.digits.back().copied(),
            recent: {
                let skip = inner.digits.len().saturating_sub(RECENT_DIGITS);
                inner.digits.iter().skip(skip).copied().collect()
            },
            processed: inner.processed,
            sample_size: inner.digits.len(),
            frequency,
            even_percent,
            odd_percent,
            rise_percent,
            fall_percent,
        }
    }

    fn split_percent<A, B>(&self, first: A, second: B) -> (f64, f64)
    where
        A: Fn(u8) -> bool,
        B: Fn(u8) -> bool,
    {
        let inner = self.lock();
        let total = inner.digits.len();
        let a = inner.digits.iter().filter(|&&d| first(d)).count();
        let b = inner.digits.iter().filter(|&&d| second(d)).count();
        (percent(a, total), percent(b, total))
    }
}

impl EventSink for DigitTracker {
    fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()> {
        if let StreamEvent::Tick(tick) = event {
            self.record(tick);
        }
        Ok(())
    }
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    count as f64 * 100.0 / total as f64
}
