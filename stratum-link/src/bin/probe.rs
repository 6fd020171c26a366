//! Stratum connection probe.
//!
//! `connect` runs the client handshake against a pool and prints what the
//! pool sends. `serve` accepts miners and answers legacy HTTP probes with an
//! `X-Stratum` redirect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use stratum_link::config::PoolConfig;
use stratum_link::stratum_v1::{
    ChannelDispatcher, ClientEvent, CommandDispatcher, Connection, ConnectionEvent,
    JsonRpcMessage, LineParser, Role, StratumResult,
};
use stratum_link::tracing::{self, prelude::*};

/// Probe Stratum v1 pools and miners
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a pool, subscribe, authorize and log its traffic
    Connect {
        /// Pool URL (stratum+tcp://host:port or host:port)
        #[arg(long, env = "STRATUM_POOL_URL")]
        url: String,

        /// Worker username
        #[arg(long, env = "STRATUM_POOL_USER")]
        user: String,

        /// Worker password
        #[arg(long, env = "STRATUM_POOL_PASS", default_value = "x")]
        pass: String,

        /// User agent announced in mining.subscribe
        #[arg(long)]
        user_agent: Option<String>,

        /// Seconds to wait for the TCP connection
        #[arg(long, default_value_t = 30)]
        connect_timeout: u64,
    },

    /// Accept miners and answer HTTP probes with a Stratum redirect
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:3333")]
        listen: String,

        /// Hostname advertised in the X-Stratum header
        #[arg(long)]
        advertise_host: String,

        /// Port advertised in the X-Stratum header
        #[arg(long, default_value_t = 3333)]
        advertise_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let args = Args::parse();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT");
            }
            shutdown.cancel();
        }
    });

    match args.command {
        Command::Connect {
            url,
            user,
            pass,
            user_agent,
            connect_timeout,
        } => {
            let mut pool = PoolConfig {
                url,
                username: user,
                password: pass,
                ..Default::default()
            };
            if let Some(ua) = user_agent {
                pool.user_agent = ua;
            }
            cmd_connect(pool, Duration::from_secs(connect_timeout), shutdown).await
        }
        Command::Serve {
            listen,
            advertise_host,
            advertise_port,
        } => cmd_serve(&listen, advertise_host, advertise_port, shutdown).await,
    }
}

async fn cmd_connect(
    pool: PoolConfig,
    connect_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = pool.address()?.to_string();

    let (event_tx, mut event_rx) = mpsc::channel(100);
    let conn = Connection::new(
        None,
        Role::Client,
        Box::new(LineParser::new()),
        Arc::new(ChannelDispatcher::new(event_tx)),
    );
    let mut lifecycle = conn.events();

    tokio::time::timeout(connect_timeout, conn.connect(&addr))
        .await
        .context("Timed out connecting to pool")??;
    info!(pool = %pool.url, connection = %conn.id(), "Connected");

    conn.subscribe(Some(&pool.user_agent)).await?;
    conn.authorize(&pool.username, &pool.password).await?;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => log_client_event(&event),

            Some(event) = lifecycle.recv() => match event {
                ConnectionEvent::Ended(_) => {
                    info!("Connection closed by pool");
                    break;
                }
                ConnectionEvent::Errored { reason, .. } => {
                    warn!(error = %reason, "Connection error");
                    break;
                }
                ConnectionEvent::ProtocolError { error, .. } => {
                    warn!(%error, "Protocol error");
                }
                ConnectionEvent::Drained(_) => {}
            },

            _ = shutdown.cancelled() => break,
        }
    }

    conn.close(None);
    info!("Exiting.");
    Ok(())
}

fn log_client_event(event: &ClientEvent) {
    match event {
        ClientEvent::Subscribed {
            subscription,
            extranonce1,
            extranonce2_size,
        } => info!(
            subscription = %subscription,
            extranonce1 = hex::encode(extranonce1),
            extranonce2_size,
            "Subscribed"
        ),
        ClientEvent::Authorized => info!("Authorized"),
        ClientEvent::AuthorizationFailed(reason) => warn!(reason = %reason, "Authorization failed"),
        ClientEvent::NewJob(job) => info!(
            job_id = %job.job_id,
            clean_jobs = job.clean_jobs,
            "New job"
        ),
        ClientEvent::DifficultyChanged(difficulty) => info!(difficulty, "Difficulty changed"),
        other => info!(event = ?other, "Pool event"),
    }
}

async fn cmd_serve(
    listen: &str,
    advertise_host: String,
    advertise_port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(listen = %listen, "Listening");

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracker.spawn(serve_miner(
                    stream,
                    peer,
                    advertise_host.clone(),
                    advertise_port,
                    shutdown.clone(),
                ));
            }
            _ = shutdown.cancelled() => break,
        }
    }

    tracker.close();
    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}

async fn serve_miner(
    stream: TcpStream,
    peer: SocketAddr,
    advertise_host: String,
    advertise_port: u16,
    shutdown: CancellationToken,
) {
    let conn = Connection::new(
        Some(stream),
        Role::Server,
        Box::new(LineParser::new()),
        Arc::new(LoggingDispatcher { peer }),
    );
    let Some(mut inbound) = conn.take_inbound() else {
        return;
    };
    debug!(peer = %peer, connection = %conn.id(), "Miner connected");

    let mut first_read = true;
    loop {
        let data = tokio::select! {
            _ = shutdown.cancelled() => break,
            data = inbound.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        if first_read && is_http_probe(&data) {
            info!(peer = %peer, "Answering HTTP probe");
            if let Err(e) = conn.send_http_header(&advertise_host, advertise_port).await {
                warn!(peer = %peer, error = %e, "Failed to send HTTP header");
            }
            break;
        }
        first_read = false;

        if let Err(e) = conn.handle_data(&data).await {
            warn!(peer = %peer, error = %e, "Error handling miner data");
        }
    }

    conn.close(None);
    debug!(peer = %peer, "Miner disconnected");
}

fn is_http_probe(data: &[u8]) -> bool {
    data.starts_with(b"GET ") || data.starts_with(b"POST ")
}

/// Logs what miners send; this probe does no pool-side processing.
struct LoggingDispatcher {
    peer: SocketAddr,
}

#[async_trait]
impl CommandDispatcher for LoggingDispatcher {
    async fn dispatch(&self, conn: &Connection, commands: Vec<JsonRpcMessage>) -> StratumResult<()> {
        for command in commands {
            info!(peer = %self.peer, method = command.method(), id = command.id(), "Miner command");
            conn.set_last_command(command);
        }
        Ok(())
    }

    async fn set_difficulty(&self, _conn: &Connection, params: &Value) -> StratumResult<()> {
        debug!(peer = %self.peer, params = %params, "Ignoring set_difficulty from miner");
        Ok(())
    }

    async fn notify(&self, _conn: &Connection, params: &Value) -> StratumResult<()> {
        debug!(peer = %self.peer, params = %params, "Ignoring notify from miner");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_http_probe() {
        assert!(is_http_probe(b"GET / HTTP/1.1\r\n"));
        assert!(is_http_probe(b"POST / HTTP/1.1\r\n"));
        assert!(!is_http_probe(b"{\"method\":\"mining.subscribe\"}\n"));
        assert!(!is_http_probe(b"GE"));
    }
}
