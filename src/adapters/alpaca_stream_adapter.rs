//! Alpaca market-data WebSocket adapter implementing StreamPort.
//!
//! Each subscription is its own connection: authenticate, `listen` on
//! `T.<SYMBOL>` trade streams, then forward trades as ticks until closed.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::adapters::alpaca_rest_adapter::AlpacaCredentials;
use crate::domain::error::TraderError;
use crate::ports::stream_port::{
    StreamConnection, StreamEvent, StreamPort, Tick, forward_event, next_connection_id,
};

pub const STREAM_URL: &str = "wss://data.alpaca.markets/stream";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AlpacaStreamAdapter {
    url: String,
    credentials: AlpacaCredentials,
}

impl AlpacaStreamAdapter {
    pub fn new(credentials: AlpacaCredentials) -> Self {
        Self::with_url(credentials, STREAM_URL)
    }

    pub fn with_url(credentials: AlpacaCredentials, url: &str) -> Self {
        Self {
            url: url.to_string(),
            credentials,
        }
    }
}

pub fn trade_stream(symbol: &str) -> String {
    format!("T.{symbol}")
}

fn authenticate_message(credentials: &AlpacaCredentials) -> String {
    json!({
        "action": "authenticate",
        "data": {
            "key_id": credentials.key_id,
            "secret_key": credentials.secret_key,
        }
    })
    .to_string()
}

fn listen_message(symbols: &[String]) -> String {
    let streams: Vec<String> = symbols.iter().map(|s| trade_stream(s)).collect();
    json!({
        "action": "listen",
        "data": { "streams": streams }
    })
    .to_string()
}

/// Extract a trade from `{"stream": .., "data": {"T": symbol, "p": price}}`.
/// Anything else (auth replies, listening acks) is not a tick.
pub fn parse_trade_message(text: &str) -> Option<Tick> {
    let value: Value = serde_json::from_str(text).ok()?;
    let data = value.get("data")?;
    let symbol = data.get("T")?.as_str()?;
    let price = data.get("p")?.as_f64()?;
    Some(Tick {
        symbol: symbol.to_string(),
        price,
    })
}

#[async_trait]
impl StreamPort for AlpacaStreamAdapter {
    async fn subscribe(
        &self,
        symbols: Vec<String>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamConnection, TraderError> {
        let ws_stream = match tokio::time::timeout(CONNECTION_TIMEOUT, connect_async(&self.url)).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                return Err(TraderError::Stream {
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TraderError::Stream {
                    reason: "connection timeout".to_string(),
                });
            }
        };

        let (mut write, mut read) = ws_stream.split();
        for message in [
            authenticate_message(&self.credentials),
            listen_message(&symbols),
        ] {
            write
                .send(Message::Text(message))
                .await
                .map_err(|e| TraderError::Stream {
                    reason: e.to_string(),
                })?;
        }

        let id = next_connection_id();
        info!(connection = id, symbols = ?symbols, "stream subscribed");

        let (close_tx, mut close_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            debug!(connection = id, "closing stream");
                            let _ = write.close().await;
                            return;
                        }
                    }

                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(tick) = parse_trade_message(&text) {
                                    let event = StreamEvent::Tick { connection_id: id, tick };
                                    if !forward_event(&events, &mut close_rx, event).await {
                                        debug!(connection = id, "closed while forwarding");
                                        let _ = write.close().await;
                                        return;
                                    }
                                } else {
                                    debug!(connection = id, text = %text, "control message");
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = write.send(Message::Pong(data)).await {
                                    warn!(connection = id, error = %e, "failed to send pong");
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!(connection = id, "stream closed by server");
                                let disconnected = StreamEvent::Disconnected { connection_id: id };
                                forward_event(&events, &mut close_rx, disconnected).await;
                                return;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(connection = id, error = %e, "stream read error");
                                let disconnected = StreamEvent::Disconnected { connection_id: id };
                                forward_event(&events, &mut close_rx, disconnected).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(StreamConnection::new(id, symbols, close_tx, Some(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_message() {
        let tick = parse_trade_message(
            r#"{"stream":"T.SNDL","data":{"ev":"T","T":"SNDL","i":"1","x":2,"p":1.27,"s":100,"t":1612195200000000000}}"#,
        )
        .unwrap();
        assert_eq!(tick.symbol, "SNDL");
        assert_eq!(tick.price, 1.27);
    }

    #[test]
    fn ignores_control_messages() {
        assert!(parse_trade_message(r#"{"stream":"authorization","data":{"status":"authorized","action":"authenticate"}}"#).is_none());
        assert!(parse_trade_message(r#"{"stream":"listening","data":{"streams":["T.SNDL"]}}"#).is_none());
        assert!(parse_trade_message("not json").is_none());
    }

    #[test]
    fn listen_message_names_trade_streams() {
        let msg: Value = serde_json::from_str(&listen_message(&["SNDL".into(), "AMC".into()])).unwrap();
        assert_eq!(msg["action"], "listen");
        assert_eq!(msg["data"]["streams"], json!(["T.SNDL", "T.AMC"]));
    }

    #[test]
    fn authenticate_message_carries_keys() {
        let creds = AlpacaCredentials {
            key_id: "id".into(),
            secret_key: "secret".into(),
        };
        let msg: Value = serde_json::from_str(&authenticate_message(&creds)).unwrap();
        assert_eq!(msg["action"], "authenticate");
        assert_eq!(msg["data"]["key_id"], "id");
        assert_eq!(msg["data"]["secret_key"], "secret");
    }
}
