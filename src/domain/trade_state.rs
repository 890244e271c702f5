//! Per-symbol position lifecycle and trade ledger.
//!
//! A [`SymbolTradeState`] starts `FLAT`, moves to `OPEN` on [`open_trade`],
//! and returns to `FLAT` when [`evaluate_bar`] sees a take-profit or
//! stop-loss crossing. Every bar fed through it appends exactly one value to
//! the per-period return sequence.
//!
//! [`open_trade`]: SymbolTradeState::open_trade
//! [`evaluate_bar`]: SymbolTradeState::evaluate_bar

use std::collections::BTreeMap;
use std::fmt;

use super::error::TraderError;
use super::execution::{ExitReason, ExitRules, Slippage};
use super::ohlcv::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Flat,
    Open,
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::Flat => write!(f, "FLAT"),
            PositionState::Open => write!(f, "OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Open,
    Closed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub id: u32,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub periods_held: u32,
    pub outcome: TradeOutcome,
    pub exit_reason: Option<ExitReason>,
    /// Index into the return sequence of the bar the trade was opened on.
    pub entry_period: usize,
}

impl TradeRecord {
    /// exit / entry, once both prices are known.
    pub fn ratio(&self) -> Option<f64> {
        match self.exit_price {
            Some(exit) if self.entry_price > 0.0 => Some(exit / self.entry_price),
            _ => None,
        }
    }
}

/// What a single `evaluate_bar` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum BarOutcome {
    Held {
        period_return: f64,
    },
    Exited {
        trade_id: u32,
        reason: ExitReason,
        exit_price: f64,
        period_return: f64,
    },
    /// Take-profit and stop-loss both crossed inside one bar.
    Discarded {
        trade_id: u32,
    },
}

/// `price / reference - 1`, or 0 when there is no usable reference.
pub fn period_return(price: f64, reference: f64) -> f64 {
    if reference > 0.0 && price.is_finite() {
        price / reference - 1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct SymbolTradeState {
    symbol: String,
    state: PositionState,
    slippage: Slippage,
    ledger: BTreeMap<u32, TradeRecord>,
    returns: Vec<f64>,
    last_trade_id: u32,
    open_trade_id: Option<u32>,
    periods_held: u32,
    discarded: u32,
    incomplete: u32,
}

impl SymbolTradeState {
    pub fn new(symbol: impl Into<String>, slippage: Slippage) -> Self {
        SymbolTradeState {
            symbol: symbol.into(),
            state: PositionState::Flat,
            slippage,
            ledger: BTreeMap::new(),
            returns: Vec::new(),
            last_trade_id: 0,
            open_trade_id: None,
            periods_held: 0,
            discarded: 0,
            incomplete: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }

    pub fn ledger(&self) -> &BTreeMap<u32, TradeRecord> {
        &self.ledger
    }

    pub fn returns(&self) -> &[f64] {
        &self.returns
    }

    /// Trades that have both an entry and an exit, in id order.
    pub fn closed_trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.ledger
            .values()
            .filter(|t| t.outcome == TradeOutcome::Closed)
    }

    pub fn open_record(&self) -> Option<&TradeRecord> {
        self.open_trade_id.and_then(|id| self.ledger.get(&id))
    }

    pub fn discarded_count(&self) -> u32 {
        self.discarded
    }

    pub fn incomplete_count(&self) -> u32 {
        self.incomplete
    }

    /// FLAT -> OPEN. The quoted price is marked up by the entry slippage.
    /// Does not append a return; the caller accounts for the entry bar.
    pub fn open_trade(&mut self, quoted_price: f64, period_index: usize) -> Result<u32, TraderError> {
        self.require(PositionState::Flat, "open_trade")?;

        self.last_trade_id += 1;
        let id = self.last_trade_id;
        let entry_price = self.slippage.entry_fill(quoted_price);
        self.ledger.insert(
            id,
            TradeRecord {
                id,
                entry_price,
                exit_price: None,
                periods_held: 0,
                outcome: TradeOutcome::Open,
                exit_reason: None,
                entry_period: period_index,
            },
        );
        self.open_trade_id = Some(id);
        self.periods_held = 0;
        self.state = PositionState::Open;
        Ok(id)
    }

    /// Check one bar against the open trade's exit thresholds.
    pub fn evaluate_bar(
        &mut self,
        bar: &Bar,
        last_reference_price: f64,
        rules: &ExitRules,
    ) -> Result<BarOutcome, TraderError> {
        self.require(PositionState::Open, "evaluate_bar")?;
        let (id, entry) = match self.open_record() {
            Some(rec) => (rec.id, rec.entry_price),
            None => return Err(self.transition_error("evaluate_bar")),
        };

        let tp_price = rules.take_profit_price(entry);
        let sl_price = rules.stop_loss_price(entry);
        let at_take_profit = bar.high >= tp_price || bar.close >= tp_price;
        let at_stop_loss = bar.low <= sl_price || bar.close <= sl_price;

        let reason = match (at_take_profit, at_stop_loss) {
            (true, true) => {
                self.ledger.remove(&id);
                self.discarded += 1;
                self.returns.push(0.0);
                self.go_flat();
                return Ok(BarOutcome::Discarded { trade_id: id });
            }
            (true, false) => ExitReason::TakeProfit,
            (false, true) => ExitReason::StopLoss,
            (false, false) => {
                self.periods_held += 1;
                if let Some(rec) = self.ledger.get_mut(&id) {
                    rec.periods_held = self.periods_held;
                }
                let r = period_return(bar.close, last_reference_price);
                self.returns.push(r);
                return Ok(BarOutcome::Held { period_return: r });
            }
        };

        let threshold = match reason {
            ExitReason::TakeProfit => tp_price,
            ExitReason::StopLoss => sl_price,
        };
        let exit_price = self.slippage.exit_fill(threshold);
        let held = self.periods_held + 1;
        if let Some(rec) = self.ledger.get_mut(&id) {
            rec.exit_price = Some(exit_price);
            rec.periods_held = held;
            rec.outcome = TradeOutcome::Closed;
            rec.exit_reason = Some(reason);
        }
        let r = period_return(exit_price, last_reference_price);
        self.returns.push(r);
        self.go_flat();
        Ok(BarOutcome::Exited {
            trade_id: id,
            reason,
            exit_price,
            period_return: r,
        })
    }

    /// Append the mark-to-market return of the bar a trade was opened on.
    pub fn mark_entry_bar(&mut self, price: f64, reference: f64) -> Result<f64, TraderError> {
        self.require(PositionState::Open, "mark_entry_bar")?;
        let r = period_return(price, reference);
        self.returns.push(r);
        Ok(r)
    }

    /// Append a zero return. Position state is left untouched.
    ///
    /// Valid in either state: the driver also calls it while `Open` for an
    /// unusable bar (zero open or outside the price band), which carries the
    /// position over without evaluating exits or counting a held period.
    pub fn record_idle(&mut self) {
        self.returns.push(0.0);
    }

    /// End of replay. A trade still open has no confirmed exit and is
    /// dropped from the ledger; returns already appended stay as they are.
    pub fn finalize(&mut self) -> Option<TradeRecord> {
        let dropped = match self.open_trade_id {
            Some(id) if self.is_open() => self.ledger.remove(&id),
            _ => None,
        };
        if dropped.is_some() {
            self.incomplete += 1;
        }
        self.go_flat();
        dropped
    }

    fn go_flat(&mut self) {
        self.state = PositionState::Flat;
        self.open_trade_id = None;
        self.periods_held = 0;
    }

    fn require(&self, wanted: PositionState, operation: &str) -> Result<(), TraderError> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(self.transition_error(operation))
        }
    }

    fn transition_error(&self, operation: &str) -> TraderError {
        TraderError::InvalidTransition {
            symbol: self.symbol.clone(),
            state: self.state.to_string(),
            operation: operation.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(
            "SNDL",
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            1_000,
        )
    }

    fn rules() -> ExitRules {
        ExitRules {
            take_profit: 1.10,
            stop_loss: 0.97,
        }
    }

    fn unslipped() -> SymbolTradeState {
        SymbolTradeState::new("SNDL", Slippage::none())
    }

    #[test]
    fn starts_flat_and_empty() {
        let s = unslipped();
        assert_eq!(s.state(), PositionState::Flat);
        assert!(s.ledger().is_empty());
        assert!(s.returns().is_empty());
    }

    #[test]
    fn open_trade_applies_markup_and_numbers_from_one() {
        let mut s = SymbolTradeState::new("SNDL", Slippage::default());
        let id = s.open_trade(2.0, 0).unwrap();
        assert_eq!(id, 1);
        assert!(s.is_open());
        let rec = s.open_record().unwrap();
        assert_relative_eq!(rec.entry_price, 2.01);
        assert_eq!(rec.outcome, TradeOutcome::Open);
        assert!(rec.exit_price.is_none());
    }

    #[test]
    fn open_twice_is_rejected() {
        let mut s = unslipped();
        s.open_trade(2.0, 0).unwrap();
        let err = s.open_trade(2.0, 1).unwrap_err();
        assert!(matches!(err, TraderError::InvalidTransition { .. }));
        assert_eq!(s.ledger().len(), 1);
    }

    #[test]
    fn evaluate_while_flat_is_rejected() {
        let mut s = unslipped();
        let err = s.evaluate_bar(&bar(2.0, 2.1, 1.9, 2.0), 2.0, &rules());
        assert!(err.is_err());
        assert!(s.returns().is_empty());
    }

    #[test]
    fn tie_discards_trade() {
        let mut s = unslipped();
        s.open_trade(2.0, 0).unwrap();
        let out = s
            .evaluate_bar(&bar(2.05, 2.30, 1.93, 2.10), 2.0, &rules())
            .unwrap();
        assert_eq!(out, BarOutcome::Discarded { trade_id: 1 });
        assert_eq!(s.state(), PositionState::Flat);
        assert!(s.ledger().is_empty());
        assert_eq!(s.returns(), &[0.0]);
        assert_eq!(s.discarded_count(), 1);
    }

    #[test]
    fn take_profit_exit_discounts_threshold() {
        let mut s = SymbolTradeState::new(
            "SNDL",
            Slippage {
                entry_markup: 0.0,
                ..Slippage::default()
            },
        );
        s.open_trade(2.0, 0).unwrap();
        let out = s
            .evaluate_bar(&bar(2.08, 2.25, 2.05, 2.10), 2.08, &rules())
            .unwrap();

        let expected_exit = 2.20 * 0.995;
        match out {
            BarOutcome::Exited {
                reason,
                exit_price,
                period_return,
                ..
            } => {
                assert_eq!(reason, ExitReason::TakeProfit);
                assert_relative_eq!(exit_price, expected_exit, epsilon = 1e-12);
                assert_relative_eq!(period_return, expected_exit / 2.08 - 1.0, epsilon = 1e-12);
            }
            other => panic!("expected exit, got {other:?}"),
        }
        let rec = &s.ledger()[&1];
        assert_eq!(rec.outcome, TradeOutcome::Closed);
        assert_eq!(rec.periods_held, 1);
        assert_eq!(s.state(), PositionState::Flat);
    }

    #[test]
    fn stop_loss_on_close() {
        let mut s = unslipped();
        s.open_trade(10.0, 0).unwrap();
        // low stays above 9.70 but close crosses it
        let out = s
            .evaluate_bar(&bar(9.9, 9.95, 9.71, 9.70), 9.9, &rules())
            .unwrap();
        assert!(matches!(
            out,
            BarOutcome::Exited {
                reason: ExitReason::StopLoss,
                ..
            }
        ));
        assert_relative_eq!(s.ledger()[&1].exit_price.unwrap(), 9.7, epsilon = 1e-12);
    }

    #[test]
    fn neither_threshold_holds_and_counts_periods() {
        let mut s = unslipped();
        s.open_trade(10.0, 0).unwrap();
        s.evaluate_bar(&bar(10.0, 10.5, 9.8, 10.2), 10.0, &rules())
            .unwrap();
        s.evaluate_bar(&bar(10.2, 10.6, 10.0, 10.4), 10.2, &rules())
            .unwrap();
        s.evaluate_bar(&bar(10.4, 10.9, 10.3, 10.8), 10.4, &rules())
            .unwrap();

        assert_eq!(s.returns().len(), 3);
        assert_relative_eq!(s.returns()[0], 0.02, epsilon = 1e-12);
        assert_eq!(s.ledger()[&1].periods_held, 3);
    }

    #[test]
    fn idle_appends_exact_zero_and_keeps_state() {
        let mut s = unslipped();
        s.record_idle();
        assert_eq!(s.returns(), &[0.0]);
        assert_eq!(s.state(), PositionState::Flat);

        s.open_trade(5.0, 1).unwrap();
        s.record_idle();
        assert!(s.is_open());
        assert_eq!(s.returns(), &[0.0, 0.0]);
        // an idle bar is not a held period
        assert_eq!(s.open_record().unwrap().periods_held, 0);
    }

    #[test]
    fn trade_ids_continue_after_discard() {
        let mut s = unslipped();
        s.open_trade(2.0, 0).unwrap();
        s.evaluate_bar(&bar(2.0, 2.30, 1.90, 2.0), 2.0, &rules())
            .unwrap();
        let id = s.open_trade(2.0, 1).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn finalize_drops_unexited_trade() {
        let mut s = unslipped();
        s.open_trade(10.0, 0).unwrap();
        s.mark_entry_bar(10.1, 10.0).unwrap();
        let dropped = s.finalize().unwrap();
        assert_eq!(dropped.id, 1);
        assert!(s.ledger().is_empty());
        assert_eq!(s.returns().len(), 1);
        assert_eq!(s.incomplete_count(), 1);
        assert_eq!(s.state(), PositionState::Flat);
    }

    #[test]
    fn finalize_when_flat_is_a_noop() {
        let mut s = unslipped();
        s.record_idle();
        assert!(s.finalize().is_none());
        assert_eq!(s.incomplete_count(), 0);
    }

    #[test]
    fn zero_reference_yields_zero_return() {
        assert_eq!(period_return(5.0, 0.0), 0.0);
        assert_eq!(period_return(f64::NAN, 1.0), 0.0);
        assert_relative_eq!(period_return(1.1, 1.0), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn ratio_requires_exit() {
        let mut s = unslipped();
        s.open_trade(2.0, 0).unwrap();
        assert!(s.open_record().unwrap().ratio().is_none());
        s.evaluate_bar(&bar(2.0, 2.25, 2.05, 2.10), 2.0, &rules())
            .unwrap();
        assert_relative_eq!(s.ledger()[&1].ratio().unwrap(), 1.1, epsilon = 1e-12);
    }
}
