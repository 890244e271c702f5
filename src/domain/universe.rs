//! Symbol universe parsing and data validation.
//!
//! Parses symbol lists from configuration and checks that each symbol has
//! enough bars to replay.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::domain::error::TraderError;
use crate::domain::ohlcv::Bar;
use crate::ports::data_port::DataPort;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UniverseError {
    #[error("empty token in symbol list")]
    EmptyToken,

    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),
}

pub fn parse_symbols(input: &str) -> Result<Vec<String>, UniverseError> {
    let mut symbols = Vec::new();
    let mut seen = HashSet::new();

    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(UniverseError::EmptyToken);
        }
        let symbol = trimmed.to_uppercase();
        if !seen.insert(symbol.clone()) {
            return Err(UniverseError::DuplicateSymbol(symbol));
        }
        symbols.push(symbol);
    }

    Ok(symbols)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    FetchFailed(String),
    NoData,
    InsufficientBars { bars: usize, minimum: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::FetchFailed(reason) => write!(f, "{reason}"),
            SkipReason::NoData => write!(f, "no data found"),
            SkipReason::InsufficientBars { bars, minimum } => {
                write!(f, "only {bars} bars, minimum {minimum} required")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: SkipReason,
}

#[derive(Debug)]
pub struct UniverseValidationResult {
    pub bars: BTreeMap<String, Vec<Bar>>,
    pub skipped: Vec<SkippedSymbol>,
}

/// Length check shared by universe validation and the backtest driver.
pub fn check_length(bars: usize, minimum: usize) -> Result<(), SkipReason> {
    if bars == 0 {
        Err(SkipReason::NoData)
    } else if bars < minimum {
        Err(SkipReason::InsufficientBars { bars, minimum })
    } else {
        Ok(())
    }
}

pub fn validate_universe(
    data_port: &dyn DataPort,
    symbols: Vec<String>,
    limit: usize,
    min_periods: usize,
) -> Result<UniverseValidationResult, TraderError> {
    let total = symbols.len();
    let mut bars = BTreeMap::new();
    let mut skipped = Vec::new();

    for symbol in symbols {
        let series = match data_port.fetch_bars(&symbol, limit) {
            Ok(series) => series,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "skipping symbol");
                skipped.push(SkippedSymbol {
                    symbol,
                    reason: SkipReason::FetchFailed(e.to_string()),
                });
                continue;
            }
        };

        if let Err(reason) = check_length(series.len(), min_periods) {
            tracing::warn!(symbol = %symbol, %reason, "skipping symbol");
            skipped.push(SkippedSymbol { symbol, reason });
            continue;
        }

        tracing::debug!(symbol = %symbol, bars = series.len(), "symbol ok");
        bars.insert(symbol, series);
    }

    if bars.is_empty() {
        return Err(TraderError::InsufficientData {
            symbol: "all".to_string(),
            bars: 0,
            minimum: min_periods,
        });
    }

    if !skipped.is_empty() {
        tracing::info!(kept = bars.len(), total, "universe validated with skips");
    }

    Ok(UniverseValidationResult { bars, skipped })
}
