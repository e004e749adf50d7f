//! Realtime insert feed over the Phoenix websocket protocol.
//!
//! Joins `realtime:<schema>:<table>` with a `postgres_changes` INSERT filter
//! and hands every new record to the handler. Reconnects after a delay until
//! the owning `Subscription` is dropped.
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::{InsertHandler, RemoteError, RemoteRow, Result};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct RealtimeChannel {
    url: Url,
    schema: String,
    table: String,
}

impl RealtimeChannel {
    pub fn new(base: &Url, api_key: &str, schema: &str, table: &str) -> Result<Self> {
        let mut url = base
            .join("realtime/v1/websocket")
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        let ws_scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(ws_scheme)
            .map_err(|_| RemoteError::Config(format!("cannot use {ws_scheme} for {base}")))?;
        url.query_pairs_mut()
            .append_pair("apikey", api_key)
            .append_pair("vsn", "1.0.0");

        Ok(Self {
            url,
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    pub fn topic(&self) -> String {
        format!("realtime:{}:{}", self.schema, self.table)
    }

    pub fn join_message(&self) -> Value {
        json!({
            "topic": self.topic(),
            "event": "phx_join",
            "ref": "1",
            "payload": {
                "config": {
                    "postgres_changes": [
                        {"event": "INSERT", "schema": self.schema, "table": self.table}
                    ]
                }
            }
        })
    }

    pub async fn run(self, handler: InsertHandler) {
        loop {
            match self.session(&handler).await {
                Ok(()) => tracing::info!(table = %self.table, "realtime channel closed"),
                Err(e) => tracing::warn!(table = %self.table, error = %e, "realtime channel failed"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn session(&self, handler: &InsertHandler) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(self.join_message().to_string()))
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        tracing::info!(topic = %self.topic(), "joined realtime channel");

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut seq: u64 = 1;
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    seq += 1;
                    let beat = json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": seq.to_string()});
                    sink.send(Message::Text(beat.to_string()))
                        .await
                        .map_err(|e| RemoteError::Network(e.to_string()))?;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    match msg.map_err(|e| RemoteError::Network(e.to_string()))? {
                        Message::Text(text) => {
                            if let Some(row) = inserted_record(&text) {
                                handler(row);
                            }
                        }
                        Message::Ping(data) => {
                            sink.send(Message::Pong(data))
                                .await
                                .map_err(|e| RemoteError::Network(e.to_string()))?;
                        }
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Extract the new row from a `postgres_changes` INSERT frame
pub fn inserted_record(frame: &str) -> Option<RemoteRow> {
    let value: Value = serde_json::from_str(frame).ok()?;
    if value.get("event")?.as_str()? != "postgres_changes" {
        return None;
    }
    let data = value.get("payload")?.get("data")?;
    if data.get("type").and_then(Value::as_str) != Some("INSERT") {
        return None;
    }
    data.get("record")?.as_object().cloned()
}
