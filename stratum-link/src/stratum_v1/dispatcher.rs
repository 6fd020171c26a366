//! Default command dispatcher.
//!
//! [`ChannelDispatcher`] turns pool traffic into [`ClientEvent`]s on an mpsc
//! channel and keeps the connection's session state in step with it.
//!
//! Every request goes out with the same id, so responses cannot be matched
//! to requests by id. They are classified by shape and session state
//! instead:
//!
//! - an array result is the subscribe response
//! - a boolean result before authorization is the authorize response
//! - a boolean result after authorization is a share result
//! - an error before subscription is a pool error, before authorization an
//!   authorization failure, afterwards a share rejection

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::Connection;
use super::error::{MiningError, StratumError, StratumResult};
use super::inbound::CommandDispatcher;
use super::messages::{ClientEvent, JobNotification, JsonRpcMessage, parse_hex_u32};

/// Dispatcher that publishes [`ClientEvent`]s.
pub struct ChannelDispatcher {
    event_tx: mpsc::Sender<ClientEvent>,
}

impl ChannelDispatcher {
    pub fn new(event_tx: mpsc::Sender<ClientEvent>) -> Self {
        Self { event_tx }
    }

    async fn emit(&self, event: ClientEvent) -> StratumResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| StratumError::Disconnected)
    }

    async fn handle_command(&self, conn: &Connection, command: JsonRpcMessage) -> StratumResult<()> {
        match command {
            JsonRpcMessage::Request { method, params, .. } => match method.as_str() {
                "mining.set_difficulty" => conn.set_difficulty(&params).await,
                "mining.notify" => conn.notify(&params).await,
                "mining.set_extranonce" => self.handle_set_extranonce(&params).await,
                "mining.set_version_mask" => self.handle_set_version_mask(&params).await,
                "client.show_message" => {
                    let text = first_param(&params, "show_message")?
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    self.emit(ClientEvent::PoolMessage(text)).await
                }
                _ => {
                    warn!(method = %method, "Unknown notification method");
                    Ok(())
                }
            },
            JsonRpcMessage::Response { id, result, error } => {
                self.handle_response(conn, id, result, error).await
            }
        }
    }

    async fn handle_response(
        &self,
        conn: &Connection,
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
    ) -> StratumResult<()> {
        if let Some(error) = error {
            let reason = error_reason(&error);
            let event = if conn.subscription().is_empty() {
                ClientEvent::PoolError(reason)
            } else if !conn.is_authorized() {
                ClientEvent::AuthorizationFailed(reason)
            } else {
                ClientEvent::ShareRejected { reason }
            };
            return self.emit(event).await;
        }

        match result {
            Some(Value::Array(arr)) => self.handle_subscribe_result(conn, &arr).await,
            Some(Value::Bool(ok)) if !conn.is_authorized() => {
                if ok {
                    conn.mark_authorized();
                    self.emit(ClientEvent::Authorized).await
                } else {
                    self.emit(ClientEvent::AuthorizationFailed(
                        "Pool returned false".to_string(),
                    ))
                    .await
                }
            }
            Some(Value::Bool(true)) => self.emit(ClientEvent::ShareAccepted).await,
            Some(Value::Bool(false)) => {
                self.emit(ClientEvent::ShareRejected {
                    reason: "Pool returned false".to_string(),
                })
                .await
            }
            other => {
                debug!(msg_id = id, result = ?other, "Ignoring response");
                Ok(())
            }
        }
    }

    /// Result is an array: `[[subscriptions...], extranonce1, extranonce2_size]`.
    async fn handle_subscribe_result(&self, conn: &Connection, arr: &[Value]) -> StratumResult<()> {
        if arr.len() < 3 {
            return Err(StratumError::InvalidMessage(
                "subscribe result too short".to_string(),
            ));
        }

        let extranonce1_hex = arr[1].as_str().ok_or_else(|| {
            StratumError::InvalidMessage("extranonce1 not a string".to_string())
        })?;
        let extranonce1 = hex::decode(extranonce1_hex)
            .map_err(|e| StratumError::InvalidMessage(format!("Invalid extranonce1: {}", e)))?;
        let extranonce2_size = arr[2].as_u64().ok_or_else(|| {
            StratumError::InvalidMessage("extranonce2_size not a number".to_string())
        })? as usize;

        let subscription =
            subscription_id(&arr[0]).unwrap_or_else(|| extranonce1_hex.to_string());
        conn.set_subscription(subscription.clone());

        debug!(
            subscription = %subscription,
            extranonce1 = %extranonce1_hex,
            extranonce2_size,
            "Subscribed"
        );

        self.emit(ClientEvent::Subscribed {
            subscription,
            extranonce1,
            extranonce2_size,
        })
        .await
    }

    async fn handle_set_extranonce(&self, params: &Value) -> StratumResult<()> {
        let arr = params.as_array().ok_or_else(|| {
            StratumError::InvalidMessage("set_extranonce params not an array".to_string())
        })?;
        if arr.len() < 2 {
            return Err(StratumError::InvalidMessage(
                "set_extranonce params too short".to_string(),
            ));
        }

        let extranonce1 = arr[0]
            .as_str()
            .and_then(|s| hex::decode(s).ok())
            .ok_or_else(|| StratumError::InvalidMessage("extranonce1 not hex".to_string()))?;
        let extranonce2_size = arr[1].as_u64().ok_or_else(|| {
            StratumError::InvalidMessage("extranonce2_size not a number".to_string())
        })? as usize;

        self.emit(ClientEvent::ExtranonceChanged {
            extranonce1,
            extranonce2_size,
        })
        .await
    }

    async fn handle_set_version_mask(&self, params: &Value) -> StratumResult<()> {
        let mask = parse_hex_u32(first_param(params, "set_version_mask")?, "version_mask")
            .map_err(StratumError::InvalidMessage)?;
        self.emit(ClientEvent::VersionMaskSet(mask)).await
    }
}

#[async_trait]
impl CommandDispatcher for ChannelDispatcher {
    async fn dispatch(&self, conn: &Connection, commands: Vec<JsonRpcMessage>) -> StratumResult<()> {
        for command in commands {
            conn.set_last_command(command.clone());

            match self.handle_command(conn, command).await {
                Ok(()) => {}
                // Consumer went away; nothing left to deliver to
                Err(StratumError::Disconnected) => return Err(StratumError::Disconnected),
                Err(e) => warn!(connection = %conn.id(), error = %e, "Error handling command"),
            }
        }
        Ok(())
    }

    async fn set_difficulty(&self, _conn: &Connection, params: &Value) -> StratumResult<()> {
        // Manual parsing for better error context than serde
        let difficulty = first_param(params, "set_difficulty")?
            .as_f64()
            .ok_or_else(|| StratumError::InvalidMessage("difficulty not a number".to_string()))?;

        self.emit(ClientEvent::DifficultyChanged(difficulty)).await
    }

    async fn notify(&self, _conn: &Connection, params: &Value) -> StratumResult<()> {
        let arr = params.as_array().ok_or_else(|| {
            StratumError::InvalidMessage("mining.notify params not an array".to_string())
        })?;

        let job = JobNotification::from_stratum_params(arr)
            .map_err(|e| StratumError::InvalidMessage(format!("Failed to parse job: {}", e)))?;

        self.emit(ClientEvent::NewJob(job)).await
    }
}

fn first_param<'a>(params: &'a Value, method: &str) -> StratumResult<&'a Value> {
    params
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or_else(|| StratumError::InvalidMessage(format!("{} params empty", method)))
}

/// Prefer the `mining.notify` subscription, else the first one listed.
fn subscription_id(subscriptions: &Value) -> Option<String> {
    let pairs = subscriptions.as_array()?;
    let id_of = |pair: &Value| pair.get(1).and_then(Value::as_str).map(str::to_string);

    pairs
        .iter()
        .find(|pair| pair.get(0).and_then(Value::as_str) == Some("mining.notify"))
        .and_then(id_of)
        .or_else(|| pairs.first().and_then(id_of))
}

/// Error format: `[error_code, "error message", null]`.
fn error_reason(error: &Value) -> String {
    match error.as_array() {
        Some(arr) => arr
            .get(1)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                arr.first()
                    .and_then(Value::as_i64)
                    .and_then(MiningError::from_code)
                    .map(|e| e.message().to_string())
            })
            .unwrap_or_else(|| "Unknown error".to_string()),
        None => format!("{:?}", error),
    }
}
