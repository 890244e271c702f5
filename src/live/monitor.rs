//! Live position monitor.
//!
//! Watches trade ticks for every held position and sells the full quantity
//! once a tick crosses the take-profit or stop-loss threshold. The stream
//! cannot drop a single symbol, so every exit closes the connection and
//! subscribes again with the symbols that are left.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::execution::{ExitReason, ExitRules};
use crate::ports::broker_port::{BrokerOrder, BrokerPort, BrokerPosition, OrderSide};
use crate::ports::stream_port::{StreamConnection, StreamEvent, StreamPort, Tick};

/// Ticks buffered between the stream reader and the monitor.
const TICK_BUFFER: usize = 1024;

/// Positions and subscribed symbols shared between the trader loop and the
/// monitor. Always accessed through [`SharedBook`].
///
/// A symbol whose exit sell has been sent stays in `exiting` until the
/// broker stops reporting the position, and is neither monitored nor sold
/// again while it is there.
#[derive(Debug, Default, Clone)]
pub struct LiveBook {
    pub positions: Vec<BrokerPosition>,
    pub subscriptions: Vec<String>,
    pub exiting: BTreeSet<String>,
}

pub type SharedBook = Arc<Mutex<LiveBook>>;

impl LiveBook {
    pub fn shared() -> SharedBook {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Open position for `symbol`, unless its exit is already in flight.
    pub fn position(&self, symbol: &str) -> Option<&BrokerPosition> {
        if self.exiting.contains(symbol) {
            return None;
        }
        self.positions
            .iter()
            .find(|p| p.symbol == symbol && p.qty != 0.0)
    }

    /// Symbols with a non-zero position and no exit in flight, sorted.
    pub fn held_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .positions
            .iter()
            .filter(|p| p.qty != 0.0 && !self.exiting.contains(&p.symbol))
            .map(|p| p.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Replace positions with a broker snapshot. Working sell orders against
    /// a held symbol count as exits in flight; an exit is settled once the
    /// broker no longer reports the position.
    pub fn sync(&mut self, positions: Vec<BrokerPosition>, orders: &[BrokerOrder]) {
        let is_held = |symbol: &str| positions.iter().any(|p| p.symbol == symbol && p.qty != 0.0);
        self.exiting.retain(|symbol| is_held(symbol.as_str()));
        for order in orders {
            if order.side == OrderSide::Sell && order.qty != 0.0 && is_held(order.symbol.as_str()) {
                self.exiting.insert(order.symbol.clone());
            }
        }
        self.positions = positions;
    }

    fn begin_exit(&mut self, symbol: &str) {
        self.exiting.insert(symbol.to_string());
        self.subscriptions.retain(|s| s != symbol);
    }

    fn abort_exit(&mut self, symbol: &str) {
        self.exiting.remove(symbol);
        if !self.subscriptions.iter().any(|s| s == symbol) {
            self.subscriptions.push(symbol.to_string());
            self.subscriptions.sort();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Cancelled,
    NoSymbols,
    SubscribeFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::NoSymbols => write!(f, "no symbols left to monitor"),
            StopReason::SubscribeFailed(reason) => write!(f, "subscribe failed: {reason}"),
        }
    }
}

/// Progress reported to whoever owns the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Exited {
        symbol: String,
        qty: f64,
        price: f64,
        reason: ExitReason,
    },
    Resubscribed {
        connection_id: u64,
        symbols: Vec<String>,
    },
    Stopped {
        reason: StopReason,
    },
}

pub struct LiveMonitor {
    broker: Arc<dyn BrokerPort>,
    stream: Arc<dyn StreamPort>,
    rules: ExitRules,
    book: SharedBook,
    events: mpsc::Sender<MonitorEvent>,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<StopReason>,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the monitor to stop and wait for it.
    pub async fn stop(self) -> Option<StopReason> {
        let _ = self.shutdown_tx.send(true);
        match self.join.await {
            Ok(reason) => Some(reason),
            Err(e) => {
                warn!(error = %e, "monitor task failed");
                None
            }
        }
    }
}

impl LiveMonitor {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        stream: Arc<dyn StreamPort>,
        rules: ExitRules,
        book: SharedBook,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            broker,
            stream,
            rules,
            book,
            events,
        }
    }

    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle { shutdown_tx, join }
    }

    /// Monitor until cancelled, out of symbols, or unable to resubscribe.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> StopReason {
        let (tick_tx, mut tick_rx) = mpsc::channel(TICK_BUFFER);

        let symbols = {
            let mut book = self.book.lock().await;
            book.subscriptions = book.held_symbols();
            book.subscriptions.clone()
        };
        info!(symbols = ?symbols, "monitoring started");

        let mut connection = match self.connect(symbols, &tick_tx).await {
            Ok(connection) => connection,
            Err(reason) => return self.finish(reason, None).await,
        };

        let (reason, connection) = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break (StopReason::Cancelled, Some(connection));
                    }
                }

                event = tick_rx.recv() => {
                    let resubscribe = match event {
                        Some(StreamEvent::Tick { connection_id, tick }) if connection_id == connection.id => {
                            self.handle_tick(&tick).await
                        }
                        Some(StreamEvent::Disconnected { connection_id }) if connection_id == connection.id => {
                            warn!(connection = connection_id, "stream disconnected, resubscribing");
                            true
                        }
                        Some(other) => {
                            debug!(event = ?other, "event from a closed connection ignored");
                            false
                        }
                        // tick_tx is held here, so the channel cannot close
                        None => false,
                    };

                    if resubscribe {
                        connection = match self.resubscribe(connection, &tick_tx).await {
                            Ok(connection) => connection,
                            Err(reason) => break (reason, None),
                        };
                    }
                }
            }
        };

        self.finish(reason, connection).await
    }

    /// Returns true when the position was sold and the stream must be
    /// rebuilt without it.
    async fn handle_tick(&self, tick: &Tick) -> bool {
        let (position, reason) = {
            let mut book = self.book.lock().await;
            let Some(position) = book.position(&tick.symbol).cloned() else {
                return false;
            };
            let Some(reason) = self.rules.trigger(position.avg_entry_price, tick.price) else {
                return false;
            };
            book.begin_exit(&position.symbol);
            (position, reason)
        };

        if let Err(e) = self.broker.sell(&position.symbol, position.qty).await {
            warn!(symbol = %position.symbol, error = %e, "exit sell failed");
            self.book.lock().await.abort_exit(&position.symbol);
            return false;
        }
        info!(
            symbol = %position.symbol,
            qty = position.qty,
            price = tick.price,
            reason = %reason,
            "position exited"
        );

        self.emit(MonitorEvent::Exited {
            symbol: position.symbol,
            qty: position.qty,
            price: tick.price,
            reason,
        });
        true
    }

    async fn resubscribe(
        &self,
        current: StreamConnection,
        tick_tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<StreamConnection, StopReason> {
        current.close().await;
        let symbols = self.book.lock().await.subscriptions.clone();
        let connection = self.connect(symbols, tick_tx).await?;

        match self.broker.positions().await {
            Ok(positions) => self.book.lock().await.sync(positions, &[]),
            Err(e) => warn!(error = %e, "position refresh failed"),
        }
        Ok(connection)
    }

    async fn connect(
        &self,
        symbols: Vec<String>,
        tick_tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<StreamConnection, StopReason> {
        if symbols.is_empty() {
            return Err(StopReason::NoSymbols);
        }
        let connection = self
            .stream
            .subscribe(symbols.clone(), tick_tx.clone())
            .await
            .map_err(|e| StopReason::SubscribeFailed(e.to_string()))?;
        self.emit(MonitorEvent::Resubscribed {
            connection_id: connection.id,
            symbols,
        });
        Ok(connection)
    }

    async fn finish(&self, reason: StopReason, connection: Option<StreamConnection>) -> StopReason {
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.book.lock().await.subscriptions.clear();
        info!(reason = %reason, "monitoring stopped");
        self.emit(MonitorEvent::Stopped {
            reason: reason.clone(),
        });
        reason
    }

    fn emit(&self, event: MonitorEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "monitor event dropped");
        }
    }
}
