//! Core domain types and logic.

pub mod ohlcv;
pub mod execution;
pub mod trade_state;
pub mod indicator;
pub mod strategy;
pub mod backtest;
pub mod metrics;
pub mod universe;
pub mod config_validation;
pub mod error;
