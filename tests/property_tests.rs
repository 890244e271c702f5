//! Property tests for the backtest driver.
//!
//! 1. One return per bar after the warm-up bar
//! 2. Replays are deterministic
//! 3. Nothing is left open and every ledger entry is a closed trade

mod common;

use alpaca_trader::domain::backtest::{BacktestConfig, run_symbol};
use alpaca_trader::domain::execution::ExitRules;
use alpaca_trader::domain::strategy::Strategy as TradeStrategy;
use alpaca_trader::domain::trade_state::TradeOutcome;
use common::*;
use proptest::prelude::*;

fn arb_bar() -> impl Strategy<Value = (f64, f64, f64, f64)> {
    (0.0..8.0_f64, 0.0..0.3_f64, 0.0..0.3_f64, -1.0..1.0_f64).prop_map(|(open, up, down, drift)| {
        let open = (open * 100.0).round() / 100.0;
        let high = open * (1.0 + up);
        let low = open * (1.0 - down);
        let close = (low + (high - low) * (drift + 1.0) / 2.0).clamp(low, high);
        (open, high, low, close)
    })
}

fn arb_rows() -> impl Strategy<Value = Vec<(f64, f64, f64, f64)>> {
    prop::collection::vec(arb_bar(), 2..60)
}

/// Enter whenever the open is below the previous close.
fn dip_buyer() -> TradeStrategy {
    TradeStrategy::from_predicate("dip", |_: &str, price: f64, history: &[Bar]| {
        history.len() >= 2 && price < history[history.len() - 2].close
    })
}

fn config() -> BacktestConfig {
    BacktestConfig {
        min_periods: 2,
        exit_rules: ExitRules {
            take_profit: 1.05,
            stop_loss: 0.95,
        },
        ..BacktestConfig::default()
    }
}

proptest! {
    #[test]
    fn one_return_per_bar_after_warmup(rows in arb_rows()) {
        let bars = series("SNDL", &rows);
        let run = run_symbol("SNDL", bars, &dip_buyer(), &config()).unwrap();
        prop_assert_eq!(run.trades.returns().len(), rows.len() - 1);
        prop_assert_eq!(run.period_timestamps.len(), rows.len() - 1);
    }

    #[test]
    fn replay_is_deterministic(rows in arb_rows()) {
        let first = run_symbol("SNDL", series("SNDL", &rows), &dip_buyer(), &config()).unwrap();
        let second = run_symbol("SNDL", series("SNDL", &rows), &dip_buyer(), &config()).unwrap();

        let a: Vec<u64> = first.trades.returns().iter().map(|r| r.to_bits()).collect();
        let b: Vec<u64> = second.trades.returns().iter().map(|r| r.to_bits()).collect();
        prop_assert_eq!(a, b);
        prop_assert_eq!(first.trades.ledger(), second.trades.ledger());
    }

    #[test]
    fn ledger_holds_only_closed_trades(rows in arb_rows()) {
        let run = run_symbol("SNDL", series("SNDL", &rows), &dip_buyer(), &config()).unwrap();
        prop_assert!(!run.trades.is_open());
        prop_assert!(run.trades.open_record().is_none());
        for trade in run.trades.ledger().values() {
            prop_assert_eq!(trade.outcome, TradeOutcome::Closed);
            prop_assert!(trade.exit_price.is_some());
            prop_assert!(trade.periods_held >= 1);
        }
    }
}
