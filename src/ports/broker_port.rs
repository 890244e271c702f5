//! Brokerage port trait: account state, market data, clock and orders.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::error::TraderError;
use crate::domain::ohlcv::Bar;

/// A held position as reported by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub buying_power: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketClock {
    pub timestamp: DateTime<Utc>,
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

impl MarketClock {
    pub fn seconds_until_close(&self) -> i64 {
        (self.next_close - self.timestamp).num_seconds()
    }
}

/// The broker's order, account and market-data API.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn positions(&self) -> Result<Vec<BrokerPosition>, TraderError>;

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, TraderError>;

    async fn account(&self) -> Result<Account, TraderError>;

    async fn last_trade_price(&self, symbol: &str) -> Result<f64, TraderError>;

    /// Recent bars per symbol, ascending. Symbols with no data are absent.
    async fn historical_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        limit: usize,
    ) -> Result<BTreeMap<String, Vec<Bar>>, TraderError>;

    async fn clock(&self) -> Result<MarketClock, TraderError>;

    async fn buy(&self, symbol: &str, qty: u64) -> Result<BrokerOrder, TraderError>;

    async fn sell(&self, symbol: &str, qty: f64) -> Result<BrokerOrder, TraderError>;

    async fn bracket_order(
        &self,
        symbol: &str,
        qty: u64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<BrokerOrder, TraderError>;
}
