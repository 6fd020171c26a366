//! TCP socket setup for Stratum connections.
//!
//! Every stream a [`Connection`](super::Connection) owns goes through
//! [`configure`] first: Nagle's algorithm off so short JSON lines are not
//! held back, and kernel keep-alive probing so a silently dead pool is
//! noticed. Setting either option can fail on exotic platforms; failures are
//! logged and otherwise ignored.

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::error::{StratumError, StratumResult};
use crate::config::ConnectionConfig;

/// Apply low-latency and keep-alive settings to a stream.
pub fn configure(stream: TcpStream, config: &ConnectionConfig) -> TcpStream {
    if let Err(e) = stream.set_nodelay(config.no_delay) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let keepalive = TcpKeepalive::new().with_time(config.keepalive);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Failed to enable TCP keep-alive");
    }

    trace!(
        no_delay = config.no_delay,
        keepalive_secs = config.keepalive.as_secs(),
        "Configured socket"
    );
    stream
}

/// Open a new outbound stream to `addr` and configure it.
pub async fn connect(addr: &str, config: &ConnectionConfig) -> StratumResult<TcpStream> {
    debug!(addr = %addr, "Connecting");

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| StratumError::ConnectionFailed(e.to_string()))?;

    debug!(addr = %addr, "Connected");
    Ok(configure(stream, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_applies_nodelay_and_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _peer = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let stream = connect(&addr.to_string(), &ConnectionConfig::default())
            .await
            .unwrap();

        assert!(stream.nodelay().unwrap());
        let sock = SockRef::from(&stream);
        assert!(sock.keepalive().unwrap());
        #[cfg(target_os = "linux")]
        assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_configure_existing_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (accepted, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let stream = configure(accepted, &ConnectionConfig::default());
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&addr.to_string(), &ConnectionConfig::default()).await;
        assert!(matches!(result, Err(StratumError::ConnectionFailed(_))));
    }
}
