//! Return aggregation over completed trade ledgers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trade_state::TradeRecord;

/// Win/loss statistics and compounded return over a set of closed trades.
///
/// Per-class return figures are fractional (`exit / entry - 1`); holding
/// times are in bars. `overall_return` is the product of every trade's
/// `exit / entry`, so 1.0 means flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub success_trades: usize,
    pub avg_success_trade: f64,
    pub largest_success_trade: f64,
    pub avg_time_in_success_trade: f64,
    pub longest_time_in_success_trade: u32,
    pub failed_trades: usize,
    pub avg_failed_trade: f64,
    pub largest_failed_trade: f64,
    pub avg_time_in_failed_trade: f64,
    pub longest_time_in_failed_trade: u32,
    pub overall_return: f64,
    pub data_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ClassStats {
    count: usize,
    total_return: f64,
    extreme_return: f64,
    total_periods: u64,
    longest: u32,
}

impl ClassStats {
    fn add(&mut self, ret: f64, periods: u32, more_extreme: impl Fn(f64, f64) -> bool) {
        if self.count == 0 || more_extreme(ret, self.extreme_return) {
            self.extreme_return = ret;
        }
        self.count += 1;
        self.total_return += ret;
        self.total_periods += u64::from(periods);
        self.longest = self.longest.max(periods);
    }

    fn mean_return(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_return / self.count as f64
        }
    }

    fn mean_periods(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_periods as f64 / self.count as f64
        }
    }
}

impl Summary {
    /// Trades without an exit price are ignored.
    pub fn from_trades<'a>(
        trades: impl IntoIterator<Item = &'a TradeRecord>,
        data_since: Option<DateTime<Utc>>,
    ) -> Self {
        let mut success = ClassStats::default();
        let mut failure = ClassStats::default();
        let mut overall_return = 1.0_f64;

        for trade in trades {
            let Some(ratio) = trade.ratio() else {
                continue;
            };
            overall_return *= ratio;

            let ret = ratio - 1.0;
            if ratio > 1.0 {
                success.add(ret, trade.periods_held, |a, b| a > b);
            } else if ratio < 1.0 {
                failure.add(ret, trade.periods_held, |a, b| a < b);
            }
        }

        Summary {
            success_trades: success.count,
            avg_success_trade: success.mean_return(),
            largest_success_trade: success.extreme_return,
            avg_time_in_success_trade: success.mean_periods(),
            longest_time_in_success_trade: success.longest,
            failed_trades: failure.count,
            avg_failed_trade: failure.mean_return(),
            largest_failed_trade: failure.extreme_return,
            avg_time_in_failed_trade: failure.mean_periods(),
            longest_time_in_failed_trade: failure.longest,
            overall_return,
            data_since,
        }
    }

    pub fn total_trades(&self) -> usize {
        self.success_trades + self.failed_trades
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.total_trades();
        if total == 0 {
            0.0
        } else {
            self.success_trades as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformancePoint {
    pub timestamp: DateTime<Utc>,
    /// Mean of the non-zero per-symbol returns for this period.
    pub mean_return: f64,
    /// Compounded `1 + mean_return` up to and including this period.
    pub cumulative: f64,
}

/// Time-aligned cross-symbol curve. A zero return marks a symbol with no
/// data that period and is left out of the mean; a period where every
/// symbol is idle has a mean of 0.
pub fn performance_curve<'a>(
    series: impl IntoIterator<Item = (&'a [DateTime<Utc>], &'a [f64])>,
) -> Vec<PerformancePoint> {
    let mut by_time: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();

    for (timestamps, returns) in series {
        for (ts, r) in timestamps.iter().zip(returns) {
            let slot = by_time.entry(*ts).or_insert((0.0, 0));
            if *r != 0.0 && r.is_finite() {
                slot.0 += r;
                slot.1 += 1;
            }
        }
    }

    let mut cumulative = 1.0;
    by_time
        .into_iter()
        .map(|(timestamp, (sum, n))| {
            let mean_return = if n == 0 { 0.0 } else { sum / n as f64 };
            cumulative *= 1.0 + mean_return;
            PerformancePoint {
                timestamp,
                mean_return,
                cumulative,
            }
        })
        .collect()
}
