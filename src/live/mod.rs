//! Live trading: the polling trader and the exit monitor it supervises.

pub mod monitor;
pub mod trader;

pub use monitor::{LiveBook, LiveMonitor, MonitorEvent, MonitorHandle, SharedBook, StopReason};
pub use trader::{LiveTrader, TraderConfig, order_quantity};
