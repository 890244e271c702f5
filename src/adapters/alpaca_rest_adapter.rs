//! Alpaca REST adapter implementing BrokerPort.
//!
//! Trading calls go to the paper or live trading API, bars and last trades
//! to the market-data API. Numeric fields arrive as strings and are parsed
//! here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::error::TraderError;
use crate::domain::ohlcv::Bar;
use crate::ports::broker_port::{
    Account, BrokerOrder, BrokerPort, BrokerPosition, MarketClock, OrderSide,
};

pub const LIVE_URL: &str = "https://api.alpaca.markets";
pub const PAPER_URL: &str = "https://paper-api.alpaca.markets";
pub const DATA_URL: &str = "https://data.alpaca.markets";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Symbols per bars request.
const BARS_CHUNK: usize = 200;

#[derive(Debug, Clone)]
pub struct AlpacaCredentials {
    pub key_id: String,
    pub secret_key: String,
}

pub struct AlpacaRestAdapter {
    client: Client,
    base_url: String,
    data_url: String,
    credentials: AlpacaCredentials,
}

fn http_error(err: reqwest::Error) -> TraderError {
    let reason = if err.is_timeout() {
        "request timeout".to_string()
    } else if err.is_connect() {
        format!("connection error: {err}")
    } else if err.is_decode() {
        format!("malformed response: {err}")
    } else if let Some(status) = err.status() {
        format!("HTTP {}: {err}", status.as_u16())
    } else {
        err.to_string()
    };
    TraderError::Broker { reason }
}

fn parse_num(field: &str, value: &str) -> Result<f64, TraderError> {
    value.trim().parse().map_err(|_| TraderError::Broker {
        reason: format!("invalid {field}: {value:?}"),
    })
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    symbol: String,
    qty: String,
    avg_entry_price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    symbol: String,
    side: String,
    #[serde(default)]
    qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    buying_power: String,
}

#[derive(Debug, Deserialize)]
struct ClockResponse {
    timestamp: DateTime<Utc>,
    is_open: bool,
    next_open: DateTime<Utc>,
    next_close: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BarResponse {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

#[derive(Debug, Deserialize)]
struct LastTradeResponse {
    last: LastTrade,
}

#[derive(Debug, Deserialize)]
struct LastTrade {
    price: f64,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    qty: String,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    time_in_force: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    take_profit: Option<LimitLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_loss: Option<StopLeg>,
}

#[derive(Debug, Serialize)]
struct LimitLeg {
    limit_price: f64,
}

#[derive(Debug, Serialize)]
struct StopLeg {
    stop_price: f64,
    limit_price: f64,
}

impl TryFrom<PositionResponse> for BrokerPosition {
    type Error = TraderError;

    fn try_from(raw: PositionResponse) -> Result<Self, Self::Error> {
        Ok(BrokerPosition {
            qty: parse_num("qty", &raw.qty)?,
            avg_entry_price: parse_num("avg_entry_price", &raw.avg_entry_price)?,
            symbol: raw.symbol,
        })
    }
}

impl TryFrom<OrderResponse> for BrokerOrder {
    type Error = TraderError;

    fn try_from(raw: OrderResponse) -> Result<Self, Self::Error> {
        let side = match raw.side.as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            other => {
                return Err(TraderError::Broker {
                    reason: format!("unknown order side {other:?}"),
                });
            }
        };
        let qty = match raw.qty.as_deref() {
            Some(q) => parse_num("qty", q)?,
            None => 0.0,
        };
        Ok(BrokerOrder {
            id: raw.id,
            symbol: raw.symbol,
            side,
            qty,
        })
    }
}

/// Alpaca encodes bar times as epoch seconds.
fn to_bar(symbol: &str, raw: &BarResponse) -> Option<Bar> {
    let timestamp = Utc.timestamp_opt(raw.t, 0).single()?;
    Some(Bar::new(symbol, timestamp, raw.o, raw.h, raw.l, raw.c, raw.v as i64))
}

impl AlpacaRestAdapter {
    pub fn new(credentials: AlpacaCredentials, paper: bool) -> Result<Self, TraderError> {
        let base_url = if paper { PAPER_URL } else { LIVE_URL };
        Self::with_urls(credentials, base_url, DATA_URL)
    }

    pub fn with_urls(
        credentials: AlpacaCredentials,
        base_url: &str,
        data_url: &str,
    ) -> Result<Self, TraderError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("APCA-API-KEY-ID", &self.credentials.key_id)
            .header("APCA-API-SECRET-KEY", &self.credentials.secret_key)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T, TraderError> {
        tracing::debug!(url = %url, "GET request");
        let response = self
            .authed(self.client.get(&url).query(query))
            .send()
            .await
            .map_err(http_error)?;
        Self::handle_response(response).await
    }

    async fn post_order(&self, order: &OrderRequest<'_>) -> Result<BrokerOrder, TraderError> {
        let url = format!("{}/v2/orders", self.base_url);
        tracing::debug!(url = %url, symbol = order.symbol, side = order.side, "POST order");
        let response = self
            .authed(self.client.post(&url).json(order))
            .send()
            .await
            .map_err(http_error)?;
        let raw: OrderResponse = Self::handle_response(response).await?;
        raw.try_into()
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, TraderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TraderError::Broker {
                reason: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }
        response.json::<T>().await.map_err(http_error)
    }

    fn market_order<'a>(symbol: &'a str, qty: String, side: &'a str) -> OrderRequest<'a> {
        OrderRequest {
            symbol,
            qty,
            side,
            order_type: "market",
            time_in_force: "day",
            order_class: None,
            take_profit: None,
            stop_loss: None,
        }
    }
}

#[async_trait]
impl BrokerPort for AlpacaRestAdapter {
    async fn positions(&self) -> Result<Vec<BrokerPosition>, TraderError> {
        let raw: Vec<PositionResponse> = self
            .get(format!("{}/v2/positions", self.base_url), &[])
            .await?;
        raw.into_iter().map(BrokerPosition::try_from).collect()
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, TraderError> {
        let raw: Vec<OrderResponse> = self
            .get(
                format!("{}/v2/orders", self.base_url),
                &[("status", "open".to_string())],
            )
            .await?;
        raw.into_iter().map(BrokerOrder::try_from).collect()
    }

    async fn account(&self) -> Result<Account, TraderError> {
        let raw: AccountResponse = self
            .get(format!("{}/v2/account", self.base_url), &[])
            .await?;
        Ok(Account {
            buying_power: parse_num("buying_power", &raw.buying_power)?,
        })
    }

    async fn last_trade_price(&self, symbol: &str) -> Result<f64, TraderError> {
        let raw: LastTradeResponse = self
            .get(format!("{}/v1/last/stocks/{}", self.data_url, symbol), &[])
            .await?;
        Ok(raw.last.price)
    }

    async fn historical_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        limit: usize,
    ) -> Result<BTreeMap<String, Vec<Bar>>, TraderError> {
        let mut result = BTreeMap::new();
        let url = format!("{}/v1/bars/{}", self.data_url, timeframe);

        for chunk in symbols.chunks(BARS_CHUNK) {
            let query = [("symbols", chunk.join(",")), ("limit", limit.to_string())];
            let raw: BTreeMap<String, Vec<BarResponse>> = match self.get(url.clone(), &query).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(error = %e, symbols = chunk.len(), "bars request failed, chunk skipped");
                    continue;
                }
            };

            for (symbol, rows) in raw {
                let mut bars: Vec<Bar> = rows.iter().filter_map(|r| to_bar(&symbol, r)).collect();
                if bars.is_empty() {
                    continue;
                }
                bars.sort_by_key(|b| b.timestamp);
                result.insert(symbol, bars);
            }
        }

        Ok(result)
    }

    async fn clock(&self) -> Result<MarketClock, TraderError> {
        let raw: ClockResponse = self.get(format!("{}/v2/clock", self.base_url), &[]).await?;
        Ok(MarketClock {
            timestamp: raw.timestamp,
            is_open: raw.is_open,
            next_open: raw.next_open,
            next_close: raw.next_close,
        })
    }

    async fn buy(&self, symbol: &str, qty: u64) -> Result<BrokerOrder, TraderError> {
        self.post_order(&Self::market_order(symbol, qty.to_string(), "buy"))
            .await
    }

    async fn sell(&self, symbol: &str, qty: f64) -> Result<BrokerOrder, TraderError> {
        self.post_order(&Self::market_order(symbol, qty.to_string(), "sell"))
            .await
    }

    async fn bracket_order(
        &self,
        symbol: &str,
        qty: u64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<BrokerOrder, TraderError> {
        let order = OrderRequest {
            time_in_force: "gtc",
            order_class: Some("bracket"),
            take_profit: Some(LimitLeg {
                limit_price: round_price(take_profit_price),
            }),
            stop_loss: Some(StopLeg {
                stop_price: round_price(stop_loss_price),
                limit_price: round_price(stop_loss_price),
            }),
            ..Self::market_order(symbol, qty.to_string(), "buy")
        };
        self.post_order(&order).await
    }
}

fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}
