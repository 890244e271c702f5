//! Streaming trade-tick port.
//!
//! A subscription cannot be edited once open: changing the symbol set means
//! closing the connection and subscribing again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::error::TraderError;

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick { connection_id: u64, tick: Tick },
    /// The reader for `connection_id` ended without being asked to.
    Disconnected { connection_id: u64 },
}

/// How long `close` waits for the reader before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle to one open subscription.
#[derive(Debug)]
pub struct StreamConnection {
    pub id: u64,
    pub symbols: Vec<String>,
    close_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    pub fn new(
        id: u64,
        symbols: Vec<String>,
        close_tx: watch::Sender<bool>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            symbols,
            close_tx,
            task,
        }
    }

    /// Signal the reader to stop and wait for it to finish. A reader that
    /// is still running after [`CLOSE_GRACE`] is aborted.
    pub async fn close(mut self) {
        let _ = self.close_tx.send(true);
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(connection = self.id, error = %e, "stream reader ended abnormally")
            }
            Err(_) => {
                tracing::warn!(connection = self.id, "stream reader did not stop, aborting");
                task.abort();
            }
        }
    }
}

/// Deliver `event` unless the connection is closed first. Readers must
/// forward through this so a consumer that stopped draining cannot hold
/// them past a close. Returns false when the reader should exit.
pub async fn forward_event(
    events: &mpsc::Sender<StreamEvent>,
    close_rx: &mut watch::Receiver<bool>,
    event: StreamEvent,
) -> bool {
    tokio::select! {
        biased;

        _ = close_rx.wait_for(|closed| *closed) => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

#[async_trait]
pub trait StreamPort: Send + Sync {
    /// Open a connection streaming trades for `symbols` into `events`.
    async fn subscribe(
        &self,
        symbols: Vec<String>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamConnection, TraderError>;
}
