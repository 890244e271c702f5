//! alpaca-trader: take-profit/stop-loss trading on daily bars.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`], the async trading loop in
//! [`live`].

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod live;
pub mod ports;
