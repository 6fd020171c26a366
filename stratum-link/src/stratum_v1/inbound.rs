//! Inbound data hand-off.
//!
//! The connection does no framing of its own. Each buffer read from the
//! socket goes to a [`CommandParser`], and the resulting commands go to a
//! [`CommandDispatcher`] together with the connection they arrived on, so
//! handlers can read session state and send replies.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{trace, warn};

use super::connection::Connection;
use super::error::StratumResult;
use super::messages::JsonRpcMessage;

/// Output of one [`CommandParser::parse`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCommands {
    /// Commands in the order they appeared on the wire
    pub commands: Vec<JsonRpcMessage>,

    /// Text of every complete line consumed by this call
    pub text: String,
}

/// Turns raw inbound bytes into discrete commands.
///
/// Implementations own the framing rule, including reassembly of messages
/// split across reads.
pub trait CommandParser: Send {
    fn parse(&mut self, buf: &[u8]) -> ParsedCommands;
}

/// Routes parsed commands to their handlers.
///
/// `set_difficulty` and `notify` are the handlers a dispatcher reaches
/// through [`Connection::set_difficulty`] and [`Connection::notify`].
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Handle `commands` in order on behalf of `conn`.
    async fn dispatch(&self, conn: &Connection, commands: Vec<JsonRpcMessage>)
    -> StratumResult<()>;

    /// Handle `mining.set_difficulty` parameters.
    async fn set_difficulty(&self, conn: &Connection, params: &Value) -> StratumResult<()>;

    /// Handle `mining.notify` parameters.
    async fn notify(&self, conn: &Connection, params: &Value) -> StratumResult<()>;
}

/// Newline-delimited JSON parser.
///
/// Keeps the trailing partial line of each buffer and prepends it to the
/// next one, so messages fragmented across TCP segments come out whole.
/// Blank lines are skipped. Lines that are not JSON-RPC messages are logged
/// and dropped.
#[derive(Debug, Default)]
pub struct LineParser {
    carry: Vec<u8>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

impl CommandParser for LineParser {
    fn parse(&mut self, buf: &[u8]) -> ParsedCommands {
        self.carry.extend_from_slice(buf);

        let Some(last_newline) = self.carry.iter().rposition(|&b| b == b'\n') else {
            return ParsedCommands::default();
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        let mut parsed = ParsedCommands::default();
        for raw in complete.split(|&b| b == b'\n') {
            let Ok(line) = std::str::from_utf8(raw) else {
                warn!(len = raw.len(), "Dropping line that is not UTF-8");
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            trace!(rx = %line, "Received message");
            parsed.text.push_str(line);
            parsed.text.push('\n');

            match serde_json::from_str(line) {
                Ok(msg) => parsed.commands.push(msg),
                Err(e) => warn!(error = %e, line = %line, "Received malformed message, ignoring"),
            }
        }
        parsed
    }
}

impl Connection {
    /// Parse `buf` and dispatch the commands it completes.
    ///
    /// Client-role connections call this for every read. Server-role owners
    /// call it with the bytes they read from [`Connection::take_inbound`].
    pub async fn handle_data(&self, buf: &[u8]) -> StratumResult<()> {
        let parsed = self.parser().lock().parse(buf);
        if parsed.commands.is_empty() {
            return Ok(());
        }

        self.dispatcher().dispatch(self, parsed.commands).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording collaborators and an in-memory connection for tests.

    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use tokio::io::DuplexStream;

    use super::{CommandDispatcher, LineParser};
    use crate::stratum_v1::connection::{Connection, Role};
    use crate::stratum_v1::error::StratumResult;
    use crate::stratum_v1::messages::JsonRpcMessage;

    /// Dispatcher that records what it was handed.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingDispatcher {
        dispatched: Arc<Mutex<Vec<Vec<JsonRpcMessage>>>>,
        forwarded: Arc<Mutex<Vec<(&'static str, Value)>>>,
    }

    impl RecordingDispatcher {
        /// Number of dispatch calls so far.
        pub fn count(&self) -> usize {
            self.dispatched.lock().len()
        }

        pub fn dispatched(&self) -> Vec<Vec<JsonRpcMessage>> {
            self.dispatched.lock().clone()
        }

        pub fn forwarded(&self) -> Vec<(&'static str, Value)> {
            self.forwarded.lock().clone()
        }

        /// Wait until at least `n` dispatch calls have been recorded.
        pub async fn wait_for(&self, n: usize) {
            for _ in 0..500 {
                if self.count() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("dispatcher saw {} calls, expected {}", self.count(), n);
        }
    }

    #[async_trait]
    impl CommandDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            _conn: &Connection,
            commands: Vec<JsonRpcMessage>,
        ) -> StratumResult<()> {
            self.dispatched.lock().push(commands);
            Ok(())
        }

        async fn set_difficulty(&self, _conn: &Connection, params: &Value) -> StratumResult<()> {
            self.forwarded.lock().push(("set_difficulty", params.clone()));
            Ok(())
        }

        async fn notify(&self, _conn: &Connection, params: &Value) -> StratumResult<()> {
            self.forwarded.lock().push(("notify", params.clone()));
            Ok(())
        }
    }

    /// Connection over an in-memory pipe. The returned stream is the peer.
    pub(crate) fn test_connection(role: Role) -> (Connection, DuplexStream, RecordingDispatcher) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let dispatcher = RecordingDispatcher::default();
        let conn = Connection::with_transport(
            local,
            role,
            Box::new(LineParser::new()),
            Arc::new(dispatcher.clone()),
        );
        (conn, peer, dispatcher)
    }
}
