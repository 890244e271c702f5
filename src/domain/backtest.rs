//! Deterministic bar-by-bar replay of a bar feed through per-symbol trade
//! states.
//!
//! Each symbol is replayed independently; nothing here reads the clock or a
//! random source, so identical inputs give identical ledgers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::error::TraderError;
use super::execution::{ExitRules, Slippage};
use super::metrics::{PerformancePoint, Summary, performance_curve};
use super::ohlcv::Bar;
use super::strategy::Strategy;
use super::trade_state::{BarOutcome, SymbolTradeState};
use super::universe::{SkipReason, SkippedSymbol, check_length};

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub min_price: f64,
    pub max_price: f64,
    /// Bars required after indicators are applied.
    pub min_periods: usize,
    pub exit_rules: ExitRules,
    pub slippage: Slippage,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            min_price: 1.0,
            max_price: 100.0,
            min_periods: 5,
            exit_rules: ExitRules::default(),
            slippage: Slippage::default(),
        }
    }
}

impl BacktestConfig {
    pub fn price_in_band(&self, price: f64) -> bool {
        price > 0.0 && price >= self.min_price && price <= self.max_price
    }
}

/// One symbol's replay: its final trade state plus the timestamp of every
/// period in the return sequence.
#[derive(Debug, Clone)]
pub struct SymbolRun {
    pub trades: SymbolTradeState,
    pub period_timestamps: Vec<DateTime<Utc>>,
    /// Timestamp of the warm-up bar.
    pub data_since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct BacktestResult {
    pub runs: BTreeMap<String, SymbolRun>,
    pub skipped: Vec<SkippedSymbol>,
}

impl BacktestResult {
    pub fn data_since(&self) -> Option<DateTime<Utc>> {
        self.runs.values().map(|r| r.data_since).min()
    }

    /// Aggregate all closed trades, symbol by symbol in ledger order.
    pub fn summary(&self) -> Summary {
        Summary::from_trades(
            self.runs.values().flat_map(|r| r.trades.closed_trades()),
            self.data_since(),
        )
    }

    pub fn curve(&self) -> Vec<PerformancePoint> {
        performance_curve(
            self.runs
                .values()
                .map(|r| (r.period_timestamps.as_slice(), r.trades.returns())),
        )
    }

    pub fn discarded_trades(&self) -> u32 {
        self.runs.values().map(|r| r.trades.discarded_count()).sum()
    }

    pub fn incomplete_trades(&self) -> u32 {
        self.runs.values().map(|r| r.trades.incomplete_count()).sum()
    }
}

/// Replay one symbol. Errors when the series is too short to replay.
pub fn run_symbol(
    symbol: &str,
    mut bars: Vec<Bar>,
    strategy: &Strategy,
    config: &BacktestConfig,
) -> Result<SymbolRun, TraderError> {
    bars.sort_by_key(|b| b.timestamp);
    let bars: Vec<Bar> = strategy
        .apply_indicators(bars)
        .into_iter()
        .filter(|b| [b.open, b.high, b.low, b.close].iter().all(|v| v.is_finite()))
        .collect();

    if let Err(reason) = check_length(bars.len(), config.min_periods) {
        return Err(match reason {
            SkipReason::InsufficientBars { bars, minimum } => TraderError::InsufficientData {
                symbol: symbol.to_string(),
                bars,
                minimum,
            },
            _ => TraderError::NoData {
                symbol: symbol.to_string(),
            },
        });
    }
    let Some(first) = bars.first() else {
        return Err(TraderError::NoData {
            symbol: symbol.to_string(),
        });
    };
    let data_since = first.timestamp;

    let mut state = SymbolTradeState::new(symbol, config.slippage);
    let mut period_timestamps = Vec::with_capacity(bars.len().saturating_sub(1));

    for idx in 1..bars.len() {
        let bar = &bars[idx];
        let last_reference_price = bars[idx - 1].close;
        let period = period_timestamps.len();
        period_timestamps.push(bar.timestamp);

        if !config.price_in_band(bar.open) {
            state.record_idle();
            continue;
        }

        if !state.is_open() {
            if strategy.should_enter(symbol, bar.open, &bars[..=idx]) {
                let id = state.open_trade(bar.open, period)?;
                state.mark_entry_bar(bar.close, bar.open)?;
                tracing::debug!(symbol, trade = id, price = bar.open, "entry");
            } else {
                state.record_idle();
            }
            continue;
        }

        match state.evaluate_bar(bar, last_reference_price, &config.exit_rules)? {
            BarOutcome::Held { .. } => {}
            BarOutcome::Exited {
                trade_id,
                reason,
                exit_price,
                ..
            } => {
                tracing::debug!(symbol, trade = trade_id, %reason, exit_price, "exit");
            }
            BarOutcome::Discarded { trade_id } => {
                tracing::debug!(symbol, trade = trade_id, "take-profit and stop-loss in one bar, trade discarded");
            }
        }
    }

    if let Some(dropped) = state.finalize() {
        tracing::debug!(symbol, trade = dropped.id, "no exit before end of data, trade dropped");
    }

    Ok(SymbolRun {
        trades: state,
        period_timestamps,
        data_since,
    })
}

/// Replay every symbol in the feed. Symbols without enough data are skipped.
pub fn run_backtest(
    feed: &BTreeMap<String, Vec<Bar>>,
    strategy: &Strategy,
    config: &BacktestConfig,
) -> BacktestResult {
    let mut result = BacktestResult::default();

    for (symbol, bars) in feed {
        match run_symbol(symbol, bars.clone(), strategy, config) {
            Ok(run) => {
                tracing::info!(
                    symbol = %symbol,
                    periods = run.trades.returns().len(),
                    trades = run.trades.closed_trades().count(),
                    "replayed"
                );
                result.runs.insert(symbol.clone(), run);
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "skipping symbol");
                let reason = match e {
                    TraderError::NoData { .. } => SkipReason::NoData,
                    TraderError::InsufficientData { bars, minimum, .. } => {
                        SkipReason::InsufficientBars { bars, minimum }
                    }
                    other => SkipReason::FetchFailed(other.to_string()),
                };
                result.skipped.push(SkippedSymbol {
                    symbol: symbol.clone(),
                    reason,
                });
            }
        }
    }

    result
}
