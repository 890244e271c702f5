//! Strategy configuration and composition.
//!
//! A strategy is three injected functions bundled into an immutable value:
//! an indicator pipeline, an entry predicate, and an order selector. The
//! backtest driver and the live trader both take a `&Strategy`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::indicator::{atr, sma, sma_of};
use super::ohlcv::Bar;

/// Pure transform that attaches indicator columns. May drop warm-up rows.
pub type IndicatorFn = Arc<dyn Fn(Vec<Bar>) -> Vec<Bar> + Send + Sync>;

/// `(symbol, quoted_price, history)`; `history` ends at the decision bar.
pub type EntryPredicate = Arc<dyn Fn(&str, f64, &[Bar]) -> bool + Send + Sync>;

/// Picks which simultaneous signals get capital, in priority order.
pub type OrderSelector =
    Arc<dyn Fn(Vec<PendingOrder>, &BTreeMap<String, Vec<Bar>>) -> Vec<PendingOrder> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub symbol: String,
    pub qty: u64,
    pub price: f64,
}

#[derive(Clone)]
pub struct Strategy {
    pub name: String,
    pub indicators: IndicatorFn,
    pub entry: EntryPredicate,
    pub selector: OrderSelector,
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Strategy {
    /// Indicators are identity and the selector keeps every order.
    pub fn from_predicate<F>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&str, f64, &[Bar]) -> bool + Send + Sync + 'static,
    {
        Strategy {
            name: name.into(),
            indicators: Arc::new(|bars: Vec<Bar>| bars),
            entry: Arc::new(entry),
            selector: Arc::new(|orders: Vec<PendingOrder>, _: &BTreeMap<String, Vec<Bar>>| orders),
        }
    }

    pub fn apply_indicators(&self, bars: Vec<Bar>) -> Vec<Bar> {
        (self.indicators)(bars)
    }

    pub fn should_enter(&self, symbol: &str, price: f64, history: &[Bar]) -> bool {
        (self.entry)(symbol, price, history)
    }

    pub fn select(
        &self,
        orders: Vec<PendingOrder>,
        data: &BTreeMap<String, Vec<Bar>>,
    ) -> Vec<PendingOrder> {
        (self.selector)(orders, data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmokestackParams {
    pub short_sma: usize,
    pub long_sma: usize,
    pub atr_period: usize,
    pub atr_sma: usize,
    /// Minimum percentage fall versus the reference close, e.g. 15.0.
    pub drop_pct: f64,
    pub lookback: usize,
    pub minimum_volatility: f64,
    pub max_positions: usize,
}

impl Default for SmokestackParams {
    fn default() -> Self {
        SmokestackParams {
            short_sma: 20,
            long_sma: 200,
            atr_period: 14,
            atr_sma: 10,
            drop_pct: 15.0,
            lookback: 5,
            minimum_volatility: 0.10,
            max_positions: 4,
        }
    }
}

impl SmokestackParams {
    pub fn short_col(&self) -> String {
        format!("sma_{}", self.short_sma)
    }

    pub fn long_col(&self) -> String {
        format!("sma_{}", self.long_sma)
    }

    pub fn atr_col(&self) -> String {
        format!("atr_{}", self.atr_period)
    }

    pub fn atr_sma_col(&self) -> String {
        format!("atr_sma_{}", self.atr_sma)
    }
}

const SELECTOR_ATR_WINDOW: usize = 10;

/// Buy sharp drops in an uptrend when the stock is volatile enough.
pub fn smokestack(params: SmokestackParams) -> Strategy {
    let params = Arc::new(params);

    let p = Arc::clone(&params);
    let indicators: IndicatorFn = Arc::new(move |bars: Vec<Bar>| smokestack_indicators(&p, bars));

    let p = Arc::clone(&params);
    let entry: EntryPredicate =
        Arc::new(move |_symbol: &str, price: f64, history: &[Bar]| {
            smokestack_entry(&p, price, history)
        });

    let p = Arc::clone(&params);
    let selector: OrderSelector = Arc::new(move |mut orders: Vec<PendingOrder>, data: &BTreeMap<String, Vec<Bar>>| {
        let atr_col = p.atr_col();
        let volatility = |symbol: &str| -> f64 {
            let Some(bars) = data.get(symbol) else {
                return f64::INFINITY;
            };
            let tail = &bars[bars.len().saturating_sub(SELECTOR_ATR_WINDOW)..];
            let sum: f64 = tail.iter().filter_map(|b| b.indicator(&atr_col)).sum();
            sum / SELECTOR_ATR_WINDOW as f64
        };
        orders.sort_by(|a, b| volatility(&a.symbol).total_cmp(&volatility(&b.symbol)));
        orders.truncate(p.max_positions);
        orders
    });

    Strategy {
        name: "smokestack".into(),
        indicators,
        entry,
        selector,
    }
}

fn smokestack_indicators(params: &SmokestackParams, bars: Vec<Bar>) -> Vec<Bar> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let short = sma(&closes, params.short_sma);
    let long = sma(&closes, params.long_sma);
    let atr_values = atr(&bars, params.atr_period);
    let atr_smooth = sma_of(&atr_values, params.atr_sma);

    let columns = [
        (params.short_col(), short),
        (params.long_col(), long),
        (params.atr_col(), atr_values),
        (params.atr_sma_col(), atr_smooth),
    ];

    bars.into_iter()
        .enumerate()
        .filter_map(|(i, bar)| {
            columns.iter().try_fold(bar, |bar, (name, series)| {
                series[i]
                    .filter(|v| v.is_finite())
                    .map(|v| bar.with_indicator(name.clone(), v))
            })
        })
        .collect()
}

fn smokestack_entry(params: &SmokestackParams, price: f64, history: &[Bar]) -> bool {
    let Some(last) = history.last() else {
        return false;
    };
    if history.len() <= params.lookback {
        return false;
    }
    let reference = history[history.len() - 1 - params.lookback].close;
    if reference <= 0.0 {
        return false;
    }

    let pct_change = (((price / reference) - 1.0) * 100.0 * 100.0).round() / 100.0;
    let dropped_enough = pct_change <= -params.drop_pct;

    let trending = match (last.indicator(&params.short_col()), last.indicator(&params.long_col())) {
        (Some(short), Some(long)) => short > long,
        _ => false,
    };
    let volatile = last
        .indicator(&params.atr_sma_col())
        .is_some_and(|v| v > params.minimum_volatility);

    dropped_enough && trending && volatile
}
