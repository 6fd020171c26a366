//! Stratum v1 message types and JSON-RPC serialization.
//!
//! This module defines the wire format for Stratum v1 protocol messages using
//! serde for JSON serialization. Messages follow the JSON-RPC format with
//! some Stratum-specific conventions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted by the default dispatcher.
///
/// These events are sent via channel to the consumer to report protocol
/// state changes and new work.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Subscription response received
    Subscribed {
        /// Subscription token reported by the pool
        subscription: String,
        /// Extranonce1 value from subscription
        extranonce1: Vec<u8>,
        /// Extranonce2 size in bytes
        extranonce2_size: usize,
    },

    /// Pool accepted the worker credentials
    Authorized,

    /// Pool refused the worker credentials
    AuthorizationFailed(String),

    /// New mining job received from pool
    NewJob(JobNotification),

    /// Difficulty changed
    DifficultyChanged(f64),

    /// Pool replaced the extranonce (mining.set_extranonce)
    ExtranonceChanged {
        extranonce1: Vec<u8>,
        extranonce2_size: usize,
    },

    /// Version mask set (for version rolling)
    VersionMaskSet(u32),

    /// A submitted share was accepted
    ShareAccepted,

    /// A submitted share was rejected
    ShareRejected {
        /// Rejection reason from pool
        reason: String,
    },

    /// Human-readable message from the pool (client.show_message)
    PoolMessage(String),

    /// Error response that could not be attributed to a request
    PoolError(String),
}

/// Mining job notification from pool (mining.notify).
///
/// Hash-like fields are kept in the encoding the pool sent; byte fields are
/// hex-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    /// Unique job identifier
    pub job_id: String,

    /// Previous block hash, Stratum word-swapped hex
    pub prev_hash: String,

    /// First part of coinbase transaction (before extranonce)
    pub coinbase1: Vec<u8>,

    /// Second part of coinbase transaction (after extranonce)
    pub coinbase2: Vec<u8>,

    /// Merkle branch hashes for computing merkle root
    pub merkle_branches: Vec<Vec<u8>>,

    /// Block version field
    pub version: u32,

    /// Encoded difficulty target (nbits)
    pub nbits: u32,

    /// Block timestamp (Unix epoch seconds)
    pub ntime: u32,

    /// If true, abandon all previous jobs
    pub clean_jobs: bool,
}

impl JobNotification {
    /// Parse from Stratum JSON array parameters.
    ///
    /// Uses manual parsing for better error context than serde tuple structs.
    pub fn from_stratum_params(params: &[Value]) -> Result<Self, String> {
        if params.len() < 9 {
            return Err("mining.notify params too short".to_string());
        }

        let job_id = params[0].as_str().ok_or("job_id not a string")?.to_string();
        let prev_hash = params[1]
            .as_str()
            .ok_or("prev_hash not a string")?
            .to_string();
        if prev_hash.len() != 64 || hex::decode(&prev_hash).is_err() {
            return Err(format!("prev_hash is not 32 bytes of hex: {}", prev_hash));
        }

        let coinbase1 = decode_hex_param(&params[2], "coinbase1")?;
        let coinbase2 = decode_hex_param(&params[3], "coinbase2")?;

        let branches_json = params[4].as_array().ok_or("merkle_branches not an array")?;
        let merkle_branches = branches_json
            .iter()
            .map(|branch| decode_hex_param(branch, "merkle branch"))
            .collect::<Result<Vec<_>, _>>()?;

        let version = parse_hex_u32(&params[5], "version")?;
        let nbits = parse_hex_u32(&params[6], "nbits")?;
        let ntime = parse_hex_u32(&params[7], "ntime")?;

        let clean_jobs = params[8].as_bool().ok_or("clean_jobs not a bool")?;

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }
}

fn decode_hex_param(value: &Value, name: &str) -> Result<Vec<u8>, String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("{} not a string", name))?;
    hex::decode(s).map_err(|e| format!("{} hex: {}", name, e))
}

/// Parse a big-endian hex word, tolerating a `0x` prefix.
pub(crate) fn parse_hex_u32(value: &Value, name: &str) -> Result<u32, String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("{} not a string", name))?;
    u32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("{} hex: {}", name, e))
}

/// Parameters for submitting a share to the pool.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    /// Worker username
    pub username: String,

    /// Job ID this share is for
    pub job_id: String,

    /// Extranonce2 used
    pub extranonce2: Vec<u8>,

    /// Timestamp used (Unix epoch seconds)
    pub ntime: u32,

    /// Nonce found
    pub nonce: u32,

    /// Version bits used (optional, for version rolling)
    pub version_bits: Option<u32>,
}

impl SubmitParams {
    /// Convert to Stratum hex string format for transmission.
    pub fn to_stratum_json(&self) -> Vec<Value> {
        let mut params = vec![
            Value::String(self.username.clone()),
            Value::String(self.job_id.clone()),
            Value::String(hex::encode(&self.extranonce2)),
            Value::String(format!("{:08x}", self.ntime)),
            Value::String(format!("{:08x}", self.nonce)),
        ];

        if let Some(version_bits) = self.version_bits {
            params.push(Value::String(format!("{:08x}", version_bits)));
        }

        params
    }
}

/// JSON-RPC message envelope.
///
/// Stratum uses a simplified JSON-RPC format where messages can be:
/// - Requests (have method and params, may have id)
/// - Responses (have id and result or error)
/// - Notifications (have method and params, `id: null`)
///
/// Requests serialize their members in `method`, `id`, `params` order, which
/// is what deployed pools and proxies expect to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification from client or server
    Request {
        /// Method name (e.g., "mining.notify", "mining.subscribe")
        method: String,
        /// Message ID (null for notifications)
        id: Option<u64>,
        /// Method parameters
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: u64,
        /// Result value (present on success)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error value (present on failure)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a new request message.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            method: method.into(),
            id: Some(id),
            params,
        }
    }

    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            method: method.into(),
            id: None,
            params,
        }
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    /// Check if this is a notification (request without ID).
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: None, .. })
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}
