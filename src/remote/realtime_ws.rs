//! Supabase Realtime change feed over a Phoenix channel websocket.
//!
//! One socket per subscribed table. The join is confirmed before
//! `subscribe` returns; afterwards a background task keeps the heartbeat
//! going and forwards `postgres_changes` events until the receiver is dropped
//! or the socket closes.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ChangeFeed, RemoteChange, RemoteChangeKind};
use crate::config::RemoteConfig;
use crate::error::RemoteError;

const SCHEMA: &str = "public";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_REF: &str = "1";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SupabaseRealtime {
    endpoint: String,
}

impl SupabaseRealtime {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            endpoint: config.realtime_url(),
        }
    }
}

fn topic_for(table: &str) -> String {
    format!("realtime:{SCHEMA}:{table}")
}

fn join_message(topic: &str, table: &str) -> Value {
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": SCHEMA, "table": table }
                ]
            }
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

fn heartbeat_message(seq: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": seq.to_string(),
    })
}

/// Status of the reply to our join, if `text` is that reply.
fn join_reply_status(text: &str, topic: &str) -> Option<String> {
    let msg: Value = serde_json::from_str(text).ok()?;
    if msg.get("event")?.as_str()? != "phx_reply"
        || msg.get("topic")?.as_str()? != topic
        || msg.get("ref")?.as_str()? != JOIN_REF
    {
        return None;
    }
    msg.pointer("/payload/status")?.as_str().map(String::from)
}

/// Decode a `postgres_changes` frame into a [`RemoteChange`].
pub fn parse_change(text: &str) -> Option<RemoteChange> {
    let msg: Value = serde_json::from_str(text).ok()?;
    if msg.get("event")?.as_str()? != "postgres_changes" {
        return None;
    }
    let data = msg.pointer("/payload/data")?;
    let kind = match data.get("type")?.as_str()? {
        "INSERT" => RemoteChangeKind::Insert,
        "UPDATE" => RemoteChangeKind::Update,
        "DELETE" => RemoteChangeKind::Delete,
        _ => return None,
    };
    let row = |key: &str| {
        data.get(key)
            .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
            .cloned()
    };
    Some(RemoteChange {
        table: data.get("table")?.as_str()?.to_string(),
        kind,
        new: row("record"),
        old: row("old_record"),
    })
}

async fn await_join(read: &mut SplitStream<Socket>, topic: &str) -> Result<(), RemoteError> {
    while let Some(frame) = read.next().await {
        match frame? {
            Message::Text(text) => {
                if let Some(status) = join_reply_status(&text, topic) {
                    return if status == "ok" {
                        Ok(())
                    } else {
                        Err(RemoteError::Subscription(format!(
                            "join {topic} rejected: {status}"
                        )))
                    };
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(RemoteError::Subscription(format!(
        "socket closed before {topic} was joined"
    )))
}

#[async_trait]
impl ChangeFeed for SupabaseRealtime {
    async fn subscribe(&self, table: &str) -> Result<mpsc::Receiver<RemoteChange>, RemoteError> {
        let (socket, _) = timeout(CONNECT_TIMEOUT, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| RemoteError::Subscription("realtime connect timed out".into()))??;
        let (mut write, mut read) = socket.split();

        let topic = topic_for(table);
        write
            .send(Message::Text(join_message(&topic, table).to_string()))
            .await?;
        timeout(JOIN_TIMEOUT, await_join(&mut read, &topic))
            .await
            .map_err(|_| RemoteError::Subscription(format!("join {topic} timed out")))??;
        info!(topic = %topic, "Realtime channel joined");

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
            let mut seq: u64 = 1;
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(topic = %topic, "Realtime receiver dropped, leaving channel");
                        let leave = json!({"topic": topic, "event": "phx_leave", "payload": {}, "ref": "leave"});
                        let _ = write.send(Message::Text(leave.to_string())).await;
                        let _ = write.close().await;
                        break;
                    }
                    _ = heartbeat.tick() => {
                        seq += 1;
                        if let Err(e) = write.send(Message::Text(heartbeat_message(seq).to_string())).await {
                            warn!(topic = %topic, "Realtime heartbeat failed: {e}");
                            break;
                        }
                    }
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(change) = parse_change(&text) {
                                if tx.send(change).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(topic = %topic, "Realtime socket closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(topic = %topic, "Realtime socket error: {e}");
                            break;
                        }
                    },
                }
            }
        });
        Ok(rx)
    }
}
