//! Stratum v1 connection and protocol-framing layer.
//!
//! The protocol is JSON-RPC over TCP with newline-delimited messages. This
//! module covers the client end of a single session:
//!
//! - **socket**: low-latency, keep-alive TCP setup
//! - **connection**: transport ownership, session state, lifecycle events,
//!   ordered writes with per-write completion
//! - **encoder**: outbound commands and the authorization gate
//! - **inbound**: hand-off of received bytes to a parser and dispatcher
//! - **dispatcher**: a default dispatcher that emits [`ClientEvent`]s
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_link::stratum_v1::{ChannelDispatcher, Connection, LineParser, Role};
//!
//! let (event_tx, mut event_rx) = mpsc::channel(100);
//! let conn = Connection::new(
//!     None,
//!     Role::Client,
//!     Box::new(LineParser::new()),
//!     Arc::new(ChannelDispatcher::new(event_tx)),
//! );
//! conn.connect("pool.example.com:3333").await?;
//! conn.subscribe(Some("my-miner/1.0")).await?;
//! conn.authorize("worker", "x").await?;
//!
//! while let Some(event) = event_rx.recv().await {
//!     match event {
//!         ClientEvent::NewJob(job) => { /* handle new work */ }
//!         ClientEvent::DifficultyChanged(diff) => { /* update difficulty */ }
//!         // ...
//!     }
//! }
//! ```

mod connection;
mod dispatcher;
mod encoder;
mod error;
mod inbound;
mod messages;
pub mod socket;

pub use connection::{
    AddressFamily, Connection, ConnectionEvent, InboundStream, Role, SendFuture, SocketAddress,
};
pub use dispatcher::ChannelDispatcher;
pub use error::{MiningError, StratumError, StratumResult};
pub use inbound::{CommandDispatcher, CommandParser, LineParser, ParsedCommands};
pub use messages::{ClientEvent, JobNotification, JsonRpcMessage, SubmitParams};
