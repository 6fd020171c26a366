//! Outbound Stratum commands.
//!
//! Every command other than `mining.subscribe` and `mining.authorize` is
//! refused while the connection is unauthorized, unless the caller passes
//! `bypass`. A refused send never touches the transport: subscribers get a
//! [`ConnectionEvent::ProtocolError`] and the returned future fails with
//! [`StratumError::UnauthorizedSend`].

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use super::connection::{Connection, ConnectionEvent, SendFuture};
use super::error::{MiningError, StratumError, StratumResult};
use super::messages::{JsonRpcMessage, SubmitParams};

/// Body of the canned reply to HTTP-probing miners.
const HTTP_PROBE_BODY: &str = r#"{"error": null, "result": false, "id": 0}"#;

impl Connection {
    /// Send `mining.subscribe`, optionally announcing a user agent.
    pub fn subscribe(&self, user_agent: Option<&str>) -> SendFuture {
        let params = match user_agent {
            Some(ua) => json!([ua]),
            None => json!([]),
        };
        let msg = JsonRpcMessage::request(self.request_id(), "mining.subscribe", params);
        self.send_command(&msg, true)
    }

    /// Send `mining.authorize` with worker credentials.
    pub fn authorize(&self, user: &str, pass: &str) -> SendFuture {
        let msg = JsonRpcMessage::request(self.request_id(), "mining.authorize", json!([user, pass]));
        self.send_command(&msg, true)
    }

    /// Send `mining.submit`. Counts as activity even when refused.
    pub fn submit(
        &self,
        worker: &str,
        job_id: &str,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> SendFuture {
        self.set_last_activity(None);

        let msg = JsonRpcMessage::request(
            self.request_id(),
            "mining.submit",
            json!([worker, job_id, extranonce2, ntime, nonce]),
        );
        self.send_command(&msg, false)
    }

    /// Send `mining.submit` from typed share parameters, appending version
    /// bits when present.
    pub fn submit_share(&self, params: &SubmitParams) -> SendFuture {
        self.set_last_activity(None);

        let msg = JsonRpcMessage::request(
            self.request_id(),
            "mining.submit",
            Value::Array(params.to_stratum_json()),
        );
        self.send_command(&msg, false)
    }

    /// Serialize `payload` as one line and queue it, subject to the
    /// authorization gate unless `bypass` is set.
    pub fn send_command<T: Serialize>(&self, payload: &T, bypass: bool) -> SendFuture {
        if !bypass && !self.is_authorized() {
            let error = MiningError::UnauthorizedWorker;
            debug!(connection = %self.id(), %error, "Refusing send before authorization");
            self.publish(ConnectionEvent::ProtocolError {
                connection: self.clone(),
                error,
            });
            return futures::future::ready(Err(StratumError::UnauthorizedSend(error))).boxed();
        }

        match serde_json::to_string(payload) {
            Ok(mut line) => {
                line.push('\n');
                self.send(line)
            }
            Err(e) => futures::future::ready(Err(e.into())).boxed(),
        }
    }

    /// Answer a legacy HTTP probe with a redirect to `stratum+tcp://hostname:port`.
    ///
    /// Lines are joined with bare `\n` and Content-Length is one more than
    /// the body length; probing miners in the field expect exactly this.
    pub fn send_http_header(&self, hostname: &str, port: u16) -> SendFuture {
        debug!(connection = %self.id(), hostname, port, "Sending Stratum HTTP header");
        self.send(http_probe_response(hostname, port))
    }

    /// Forward `mining.set_difficulty` parameters to the dispatcher.
    ///
    /// Called by dispatchers, not by application code.
    pub async fn set_difficulty(&self, params: &Value) -> StratumResult<()> {
        self.dispatcher().set_difficulty(self, params).await
    }

    /// Forward `mining.notify` parameters to the dispatcher.
    ///
    /// Called by dispatchers, not by application code.
    pub async fn notify(&self, params: &Value) -> StratumResult<()> {
        self.dispatcher().notify(self, params).await
    }
}

fn http_probe_response(hostname: &str, port: u16) -> String {
    [
        "HTTP/1.1 200 OK".to_string(),
        format!("X-Stratum: stratum+tcp://{}:{}", hostname, port),
        "Connection: Close".to_string(),
        format!("Content-Length: {}", HTTP_PROBE_BODY.len() + 1),
        String::new(),
        String::new(),
        HTTP_PROBE_BODY.to_string(),
    ]
    .join("\n")
}
