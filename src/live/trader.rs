//! Live trading loop.
//!
//! Polls the broker while the market is open, queues entries for symbols the
//! strategy likes, and keeps one [`LiveMonitor`] watching held positions when
//! exits are managed locally.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::error::TraderError;
use crate::domain::execution::ExitRules;
use crate::domain::ohlcv::Bar;
use crate::domain::strategy::{PendingOrder, Strategy};
use crate::live::monitor::{LiveBook, LiveMonitor, MonitorEvent, MonitorHandle, SharedBook};
use crate::ports::broker_port::{BrokerOrder, BrokerPort, BrokerPosition, OrderSide};
use crate::ports::stream_port::StreamPort;

const EVENT_BUFFER: usize = 256;

/// Headroom on the quoted price when sizing an order.
const SIZING_MARKUP: f64 = 1.05;

/// Buying power reserved per queued share, relative to the quote.
const RESERVE_MARKUP: f64 = 1.01;

#[derive(Debug, Clone, PartialEq)]
pub struct TraderConfig {
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub data_limit: usize,
    pub needed_periods: usize,
    /// When set, exits ride on bracket orders and no monitor runs.
    pub allow_daytrading: bool,
    pub iterate_every: Duration,
    pub run_during_market: bool,
    pub minutes_till_close: i64,
    pub max_positions: usize,
    pub exit_rules: ExitRules,
}

impl Default for TraderConfig {
    fn default() -> Self {
        TraderConfig {
            symbols: Vec::new(),
            timeframe: "1D".to_string(),
            data_limit: 200,
            needed_periods: 8,
            allow_daytrading: false,
            iterate_every: Duration::from_secs(60),
            run_during_market: true,
            minutes_till_close: 1,
            max_positions: 4,
            exit_rules: ExitRules::default(),
        }
    }
}

/// Shares to buy at `price`: an equal slice of buying power per slot, at
/// least one share, or zero once `held` fills every slot.
pub fn order_quantity(buying_power: f64, max_positions: usize, held: usize, price: f64) -> u64 {
    if max_positions == 0 || held >= max_positions || price.is_nan() || price <= 0.0 {
        return 0;
    }
    let allocation = buying_power / max_positions as f64;
    let qty = (allocation / (price * SIZING_MARKUP)).floor();
    if qty.is_finite() && qty >= 1.0 { qty as u64 } else { 1 }
}

struct Snapshot {
    positions: Vec<BrokerPosition>,
    orders: Vec<BrokerOrder>,
    buying_power: f64,
}

impl Snapshot {
    fn held(&self) -> usize {
        self.positions.iter().filter(|p| p.qty != 0.0).count()
    }

    /// Already held or with an order working.
    fn is_active(&self, symbol: &str) -> bool {
        self.positions
            .iter()
            .any(|p| p.symbol == symbol && p.qty != 0.0)
            || self
                .orders
                .iter()
                .any(|o| o.symbol == symbol && o.qty != 0.0)
    }
}

pub struct LiveTrader {
    config: TraderConfig,
    strategy: Strategy,
    broker: Arc<dyn BrokerPort>,
    stream: Arc<dyn StreamPort>,
    book: SharedBook,
    monitor: Option<MonitorHandle>,
    events_tx: mpsc::Sender<MonitorEvent>,
    events_rx: mpsc::Receiver<MonitorEvent>,
}

impl LiveTrader {
    pub fn new(
        config: TraderConfig,
        strategy: Strategy,
        broker: Arc<dyn BrokerPort>,
        stream: Arc<dyn StreamPort>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        LiveTrader {
            config,
            strategy,
            broker,
            stream,
            book: LiveBook::shared(),
            monitor: None,
            events_tx,
            events_rx,
        }
    }

    pub fn book(&self) -> SharedBook {
        Arc::clone(&self.book)
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_finished())
    }

    /// Poll on `iterate_every` until `shutdown` flips, then stop the monitor.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            symbols = self.config.symbols.len(),
            daytrading = self.config.allow_daytrading,
            "live trader started"
        );
        let mut ticker = tokio::time::interval(self.config.iterate_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.cycle().await;
                }
            }
        }

        self.stop_monitor().await;
        self.drain_events();
        info!("live trader stopped");
    }

    /// One poll: market clock gate, entries, then monitor upkeep.
    pub async fn cycle(&mut self) {
        self.drain_events();

        if self.config.run_during_market {
            match self.broker.clock().await {
                Ok(clock) if !clock.is_open => {
                    debug!(next_open = %clock.next_open, "market closed");
                    self.stop_monitor().await;
                    return;
                }
                Ok(clock) if clock.seconds_until_close() < 60 * self.config.minutes_till_close => {
                    info!(next_close = %clock.next_close, "market closing, idling");
                    self.stop_monitor().await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "clock unavailable, cycle skipped");
                    return;
                }
            }
        }

        self.iterate().await;
        self.ensure_monitor().await;
    }

    /// Refresh account state, screen every symbol and place the selected
    /// entries. Returns the orders that were accepted.
    pub async fn iterate(&mut self) -> Vec<PendingOrder> {
        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "account refresh failed, cycle skipped");
                return Vec::new();
            }
        };
        self.book
            .lock()
            .await
            .sync(snapshot.positions.clone(), &snapshot.orders);

        let max = self.config.max_positions;
        let held = snapshot.held();
        if held >= max {
            debug!(held, max, "positions full");
            return Vec::new();
        }
        let buy_orders = snapshot
            .orders
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .count();
        if snapshot.orders.len() >= max && buy_orders >= max {
            debug!(buy_orders, max, "pending buys fill every slot");
            return Vec::new();
        }

        info!(symbols = self.config.symbols.len(), "analyzing symbols");
        let data = match self
            .broker
            .historical_bars(&self.config.symbols, &self.config.timeframe, self.config.data_limit)
            .await
        {
            Ok(data) => self.prepare(data),
            Err(e) => {
                warn!(error = %e, "bars unavailable, cycle skipped");
                return Vec::new();
            }
        };

        let mut buying_power = snapshot.buying_power;
        let mut pending = Vec::new();
        for symbol in &self.config.symbols {
            let Some(bars) = data.get(symbol) else {
                debug!(symbol = %symbol, "no usable data");
                continue;
            };
            let price = match self.broker.last_trade_price(symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "no quote this cycle");
                    continue;
                }
            };
            if !self.strategy.should_enter(symbol, price, bars) || snapshot.is_active(symbol) {
                continue;
            }

            let qty = order_quantity(buying_power, max, held, price);
            if qty == 0 {
                break;
            }
            buying_power -= price * RESERVE_MARKUP * qty as f64;
            pending.push(PendingOrder {
                symbol: symbol.clone(),
                qty,
                price,
            });
        }

        let selected = self.strategy.select(pending, &data);
        self.execute(selected).await
    }

    async fn snapshot(&self) -> Result<Snapshot, TraderError> {
        Ok(Snapshot {
            positions: self.broker.positions().await?,
            orders: self.broker.open_orders().await?,
            buying_power: self.broker.account().await?.buying_power,
        })
    }

    fn prepare(&self, data: BTreeMap<String, Vec<Bar>>) -> BTreeMap<String, Vec<Bar>> {
        data.into_iter()
            .filter_map(|(symbol, bars)| {
                let bars = self.strategy.apply_indicators(bars);
                if bars.len() < self.config.needed_periods {
                    info!(
                        symbol = %symbol,
                        bars = bars.len(),
                        needed = self.config.needed_periods,
                        "not enough data, skipped"
                    );
                    return None;
                }
                Some((symbol, bars))
            })
            .collect()
    }

    async fn execute(&self, orders: Vec<PendingOrder>) -> Vec<PendingOrder> {
        let mut placed = Vec::new();
        for order in orders {
            let result = if self.config.allow_daytrading {
                let rules = &self.config.exit_rules;
                info!(symbol = %order.symbol, qty = order.qty, "placing bracket order");
                self.broker
                    .bracket_order(
                        &order.symbol,
                        order.qty,
                        rules.take_profit_price(order.price),
                        rules.stop_loss_price(order.price),
                    )
                    .await
            } else {
                info!(symbol = %order.symbol, qty = order.qty, "placing buy order");
                self.broker.buy(&order.symbol, order.qty).await
            };

            match result {
                Ok(_) => placed.push(order),
                Err(e) => warn!(symbol = %order.symbol, error = %e, "order rejected"),
            }
        }
        placed
    }

    /// Keep exactly one monitor whose subscriptions match the held symbols.
    pub async fn ensure_monitor(&mut self) {
        if self.config.allow_daytrading {
            self.stop_monitor().await;
            return;
        }

        let (held, subscribed) = {
            let book = self.book.lock().await;
            let mut subscribed = book.subscriptions.clone();
            subscribed.sort();
            (book.held_symbols(), subscribed)
        };
        if self.has_monitor() && held == subscribed {
            return;
        }

        self.stop_monitor().await;
        if held.is_empty() {
            return;
        }
        let monitor = LiveMonitor::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.stream),
            self.config.exit_rules,
            Arc::clone(&self.book),
            self.events_tx.clone(),
        );
        self.monitor = Some(monitor.spawn());
    }

    pub async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            if let Some(reason) = monitor.stop().await {
                debug!(reason = %reason, "monitor stopped");
            }
        }
    }

    /// Log and return whatever the monitor reported since the last call.
    pub fn drain_events(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            match &event {
                MonitorEvent::Exited {
                    symbol,
                    qty,
                    price,
                    reason,
                } => info!(symbol = %symbol, qty, price, reason = %reason, "exit filled"),
                MonitorEvent::Resubscribed {
                    connection_id,
                    symbols,
                } => debug!(connection = connection_id, symbols = ?symbols, "monitor resubscribed"),
                MonitorEvent::Stopped { reason } => info!(reason = %reason, "monitor stopped"),
            }
            events.push(event);
        }
        events
    }
}
