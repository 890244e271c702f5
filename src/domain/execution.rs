//! Fill-price simulation and exit thresholds.
//!
//! Entry fills are marked up and exit fills discounted by fixed fractions.
//! Exit thresholds are multiples of the entry price shared by the backtest
//! state machine and the live monitor.

use std::fmt;

/// Fixed multiplicative slippage applied to assumed fill prices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slippage {
    /// Fraction added to the quoted price on entry (0.005 = +0.5%).
    pub entry_markup: f64,
    /// Fraction removed from the threshold price on exit (0.005 = -0.5%).
    pub exit_discount: f64,
    /// Round marked-up entry prices to cents.
    pub round_entry: bool,
}

impl Default for Slippage {
    fn default() -> Self {
        Slippage {
            entry_markup: 0.005,
            exit_discount: 0.005,
            round_entry: true,
        }
    }
}

impl Slippage {
    pub fn none() -> Self {
        Slippage {
            entry_markup: 0.0,
            exit_discount: 0.0,
            round_entry: false,
        }
    }

    /// Buy: execution_price = quoted * (1 + entry_markup)
    pub fn entry_fill(&self, quoted: f64) -> f64 {
        let price = quoted * (1.0 + self.entry_markup);
        if self.round_entry {
            round_cents(price)
        } else {
            price
        }
    }

    /// Sell: execution_price = threshold * (1 - exit_discount)
    pub fn exit_fill(&self, threshold: f64) -> f64 {
        threshold * (1.0 - self.exit_discount)
    }
}

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

/// Take-profit / stop-loss multipliers applied to an entry price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitRules {
    /// Must be greater than 1.
    pub take_profit: f64,
    /// Must be between 0 and 1.
    pub stop_loss: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        ExitRules {
            take_profit: 1.10,
            stop_loss: 0.97,
        }
    }
}

impl ExitRules {
    pub fn take_profit_price(&self, entry: f64) -> f64 {
        entry * self.take_profit
    }

    pub fn stop_loss_price(&self, entry: f64) -> f64 {
        entry * self.stop_loss
    }

    /// Live check of a single traded price against an average entry price.
    ///
    /// With `take_profit > 1 > stop_loss` at most one side can fire; the
    /// take-profit side is reported first if a misconfiguration lets both.
    pub fn trigger(&self, avg_entry: f64, price: f64) -> Option<ExitReason> {
        if self.take_profit_price(avg_entry) <= price {
            Some(ExitReason::TakeProfit)
        } else if self.stop_loss_price(avg_entry) >= price {
            Some(ExitReason::StopLoss)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::StopLoss => write!(f, "stop_loss"),
        }
    }
}
