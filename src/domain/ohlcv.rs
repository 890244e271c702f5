//! OHLCV bar representation.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One OHLCV sample for a symbol plus any indicator columns attached by a
/// strategy's indicator pipeline. Bars are never mutated once produced;
/// indicator pipelines build new bars.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub indicators: BTreeMap<String, f64>,
}

impl Bar {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: i64,
    ) -> Self {
        Bar {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            indicators: BTreeMap::new(),
        }
    }

    pub fn indicator(&self, name: &str) -> Option<f64> {
        self.indicators.get(name).copied()
    }

    pub fn with_indicator(mut self, name: impl Into<String>, value: f64) -> Self {
        self.indicators.insert(name.into(), value);
        self
    }

    /// True when every named indicator column is present and finite.
    pub fn has_indicators(&self, names: &[&str]) -> bool {
        names
            .iter()
            .all(|n| self.indicator(n).is_some_and(f64::is_finite))
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }
}
