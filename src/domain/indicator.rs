//! Rolling-window indicator helpers.
//!
//! Each function returns one value per input, `None` until the window is
//! full.

use super::ohlcv::Bar;

/// Simple moving average over `period` values.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; values.len()];
    }

    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= period {
            sum -= values[i - period];
        }
        if i + 1 >= period {
            out.push(Some(sum / period as f64));
        } else {
            out.push(None);
        }
    }
    out
}

/// Average true range with Wilder smoothing, seeded by the mean of the first
/// `period` true ranges. The first bar's true range is `high - low`.
pub fn atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    if period == 0 || bars.len() < period {
        return vec![None; bars.len()];
    }

    let tr: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            if i == 0 {
                bar.high - bar.low
            } else {
                bar.true_range(bars[i - 1].close)
            }
        })
        .collect();

    let mut out = vec![None; bars.len()];
    let seed = tr[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);
    let mut prev = seed;
    for i in period..bars.len() {
        prev = (prev * (period - 1) as f64 + tr[i]) / period as f64;
        out[i] = Some(prev);
    }
    out
}

/// `sma` over an optional series; windows containing a gap are `None`.
pub fn sma_of(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if period == 0 || i + 1 < period {
                return None;
            }
            let window = &values[i + 1 - period..=i];
            let sum: Option<f64> = window.iter().copied().sum();
            sum.map(|s| s / period as f64)
        })
        .collect()
}
