#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use alpaca_trader::domain::error::TraderError;
pub use alpaca_trader::domain::ohlcv::Bar;
use alpaca_trader::ports::broker_port::{
    Account, BrokerOrder, BrokerPort, BrokerPosition, MarketClock, OrderSide,
};
use alpaca_trader::ports::data_port::DataPort;
use alpaca_trader::ports::stream_port::{
    StreamConnection, StreamEvent, StreamPort, Tick, forward_event, next_connection_id,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{mpsc, watch};

pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap() + Duration::days(n)
}

/// Consecutive daily bars from `(open, high, low, close)` rows.
pub fn series(symbol: &str, rows: &[(f64, f64, f64, f64)]) -> Vec<Bar> {
    rows.iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Bar::new(symbol, day(i as i64), o, h, l, c, 10_000))
        .collect()
}

/// A flat series long enough for any default window.
pub fn flat_series(symbol: &str, len: usize, price: f64) -> Vec<Bar> {
    let rows: Vec<_> = (0..len)
        .map(|_| (price, price * 1.01, price * 0.99, price))
        .collect();
    series(symbol, &rows)
}

pub fn position(symbol: &str, qty: f64, avg_entry_price: f64) -> BrokerPosition {
    BrokerPosition {
        symbol: symbol.to_string(),
        qty,
        avg_entry_price,
    }
}

pub struct MockBarFeed {
    pub data: HashMap<String, Vec<Bar>>,
    pub errors: HashMap<String, String>,
}

impl MockBarFeed {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, symbol: &str, bars: Vec<Bar>) -> Self {
        self.data.insert(symbol.to_string(), bars);
        self
    }

    pub fn with_error(mut self, symbol: &str, reason: &str) -> Self {
        self.errors.insert(symbol.to_string(), reason.to_string());
        self
    }
}

impl DataPort for MockBarFeed {
    fn fetch_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, TraderError> {
        if let Some(reason) = self.errors.get(symbol) {
            return Err(TraderError::Data {
                reason: reason.clone(),
            });
        }
        let mut bars = self.data.get(symbol).cloned().unwrap_or_default();
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }

    fn list_symbols(&self) -> Result<Vec<String>, TraderError> {
        let mut symbols: Vec<String> = self.data.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }
}

#[derive(Debug, Default)]
pub struct BrokerState {
    pub positions: Vec<BrokerPosition>,
    pub orders: Vec<BrokerOrder>,
    pub buying_power: f64,
    pub prices: HashMap<String, f64>,
    pub bars: BTreeMap<String, Vec<Bar>>,
    pub clock_open: bool,
    pub fail_account: bool,
    /// Sells are accepted but stay working: the position is still reported.
    pub hold_sells: bool,
    pub sell_delay: Option<std::time::Duration>,
    pub buys: Vec<(String, u64)>,
    pub sells: Vec<(String, f64)>,
    pub brackets: Vec<(String, u64, f64, f64)>,
}

/// In-memory broker. Selling removes the position, as a fill would, unless
/// `hold_sells` is set.
#[derive(Default)]
pub struct MockBroker {
    pub state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        {
            let mut state = broker.state.lock().unwrap();
            state.buying_power = 10_000.0;
            state.clock_open = true;
        }
        broker
    }

    pub fn with_positions(self, positions: Vec<BrokerPosition>) -> Self {
        self.state.lock().unwrap().positions = positions;
        self
    }

    pub fn with_quote(self, symbol: &str, price: f64, bars: Vec<Bar>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.prices.insert(symbol.to_string(), price);
            state.bars.insert(symbol.to_string(), bars);
        }
        self
    }

    /// Accept sells without filling them.
    pub fn holding_sells(self) -> Self {
        self.state.lock().unwrap().hold_sells = true;
        self
    }

    pub fn with_sell_delay(self, delay: std::time::Duration) -> Self {
        self.state.lock().unwrap().sell_delay = Some(delay);
        self
    }

    /// Fill every working sell order.
    pub fn fill_sells(&self) {
        let mut state = self.state.lock().unwrap();
        let sold: Vec<String> = state
            .orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell)
            .map(|o| o.symbol.clone())
            .collect();
        state.positions.retain(|p| !sold.contains(&p.symbol));
        state.orders.retain(|o| o.side != OrderSide::Sell);
    }

    pub fn sells(&self) -> Vec<(String, f64)> {
        self.state.lock().unwrap().sells.clone()
    }

    pub fn buys(&self) -> Vec<(String, u64)> {
        self.state.lock().unwrap().buys.clone()
    }

    pub fn brackets(&self) -> Vec<(String, u64, f64, f64)> {
        self.state.lock().unwrap().brackets.clone()
    }

    fn order(symbol: &str, side: OrderSide, qty: f64) -> BrokerOrder {
        BrokerOrder {
            id: format!("{symbol}-{qty}"),
            symbol: symbol.to_string(),
            side,
            qty,
        }
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    async fn positions(&self) -> Result<Vec<BrokerPosition>, TraderError> {
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, TraderError> {
        Ok(self.state.lock().unwrap().orders.clone())
    }

    async fn account(&self) -> Result<Account, TraderError> {
        let state = self.state.lock().unwrap();
        if state.fail_account {
            return Err(TraderError::Broker {
                reason: "HTTP 401: unauthorized".into(),
            });
        }
        Ok(Account {
            buying_power: state.buying_power,
        })
    }

    async fn last_trade_price(&self, symbol: &str) -> Result<f64, TraderError> {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| TraderError::Broker {
                reason: format!("no trades for {symbol}"),
            })
    }

    async fn historical_bars(
        &self,
        symbols: &[String],
        _timeframe: &str,
        _limit: usize,
    ) -> Result<BTreeMap<String, Vec<Bar>>, TraderError> {
        let state = self.state.lock().unwrap();
        Ok(symbols
            .iter()
            .filter_map(|s| state.bars.get(s).map(|b| (s.clone(), b.clone())))
            .collect())
    }

    async fn clock(&self) -> Result<MarketClock, TraderError> {
        let now = day(0) + Duration::hours(15);
        Ok(MarketClock {
            timestamp: now,
            is_open: self.state.lock().unwrap().clock_open,
            next_open: now + Duration::hours(18),
            next_close: now + Duration::hours(1),
        })
    }

    async fn buy(&self, symbol: &str, qty: u64) -> Result<BrokerOrder, TraderError> {
        self.state
            .lock()
            .unwrap()
            .buys
            .push((symbol.to_string(), qty));
        Ok(Self::order(symbol, OrderSide::Buy, qty as f64))
    }

    async fn sell(&self, symbol: &str, qty: f64) -> Result<BrokerOrder, TraderError> {
        let delay = self.state.lock().unwrap().sell_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.sells.push((symbol.to_string(), qty));
        let order = Self::order(symbol, OrderSide::Sell, qty);
        if state.hold_sells {
            state.orders.push(order.clone());
        } else {
            state.positions.retain(|p| p.symbol != symbol);
        }
        Ok(order)
    }

    async fn bracket_order(
        &self,
        symbol: &str,
        qty: u64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<BrokerOrder, TraderError> {
        self.state.lock().unwrap().brackets.push((
            symbol.to_string(),
            qty,
            take_profit_price,
            stop_loss_price,
        ));
        Ok(Self::order(symbol, OrderSide::Buy, qty as f64))
    }
}

pub struct Subscription {
    pub id: u64,
    pub symbols: Vec<String>,
    pub events: mpsc::Sender<StreamEvent>,
    pub closed: watch::Receiver<bool>,
    /// Inbound side of a reader task, when the stream runs one.
    pub wire: Option<mpsc::UnboundedSender<StreamEvent>>,
    pub reader_done: Arc<AtomicBool>,
}

impl Subscription {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Records every subscription and lets tests push events into it.
///
/// With `with_reader`, each subscription runs a reader task like the real
/// adapter: events go over an unbounded wire and the reader forwards them
/// into the monitor's bounded channel.
#[derive(Default)]
pub struct MockStream {
    pub subscriptions: Mutex<Vec<Subscription>>,
    pub fail: AtomicBool,
    pub reader: bool,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reader() -> Self {
        Self {
            reader: true,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// `(id, symbols, closed)` for every subscription so far.
    pub fn history(&self) -> Vec<(u64, Vec<String>, bool)> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.id, s.symbols.clone(), s.is_closed()))
            .collect()
    }

    pub fn reader_finished(&self, connection_id: u64) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == connection_id)
            .map(|s| s.reader_done.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn tick(&self, connection_id: u64, symbol: &str, price: f64) {
        self.send(
            connection_id,
            StreamEvent::Tick {
                connection_id,
                tick: Tick {
                    symbol: symbol.to_string(),
                    price,
                },
            },
        )
        .await;
    }

    pub async fn disconnect(&self, connection_id: u64) {
        self.send(connection_id, StreamEvent::Disconnected { connection_id })
            .await;
    }

    /// Server side hangs up: the reader sees the wire end.
    pub fn drop_wire(&self, connection_id: u64) {
        if let Some(sub) = self
            .subscriptions
            .lock()
            .unwrap()
            .iter_mut()
            .find(|s| s.id == connection_id)
        {
            sub.wire = None;
        }
    }

    async fn send(&self, connection_id: u64, event: StreamEvent) {
        let (wire, sender) = {
            let subscriptions = self.subscriptions.lock().unwrap();
            let sub = subscriptions
                .iter()
                .find(|s| s.id == connection_id)
                .expect("unknown connection");
            (sub.wire.clone(), sub.events.clone())
        };
        match wire {
            // the reader may already be gone; that is what a closed socket does
            Some(wire) => {
                let _ = wire.send(event);
            }
            None => sender.send(event).await.unwrap(),
        }
    }
}

fn spawn_reader(
    id: u64,
    mut wire: mpsc::UnboundedReceiver<StreamEvent>,
    events: mpsc::Sender<StreamEvent>,
    mut close_rx: watch::Receiver<bool>,
    done: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        break;
                    }
                }

                event = wire.recv() => match event {
                    Some(event) => {
                        if !forward_event(&events, &mut close_rx, event).await {
                            break;
                        }
                    }
                    None => {
                        let disconnected = StreamEvent::Disconnected { connection_id: id };
                        forward_event(&events, &mut close_rx, disconnected).await;
                        break;
                    }
                },
            }
        }
        done.store(true, Ordering::SeqCst);
    })
}

#[async_trait]
impl StreamPort for MockStream {
    async fn subscribe(
        &self,
        symbols: Vec<String>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamConnection, TraderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TraderError::Stream {
                reason: "connection refused".into(),
            });
        }
        let id = next_connection_id();
        let (close_tx, closed) = watch::channel(false);
        let reader_done = Arc::new(AtomicBool::new(false));
        let (wire, task) = if self.reader {
            let (wire_tx, wire_rx) = mpsc::unbounded_channel();
            let task = spawn_reader(
                id,
                wire_rx,
                events.clone(),
                closed.clone(),
                Arc::clone(&reader_done),
            );
            (Some(wire_tx), Some(task))
        } else {
            (None, None)
        };
        self.subscriptions.lock().unwrap().push(Subscription {
            id,
            symbols: symbols.clone(),
            events,
            closed,
            wire,
            reader_done,
        });
        Ok(StreamConnection::new(id, symbols, close_tx, task))
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
