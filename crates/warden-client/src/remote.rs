//! Remote analyzer speaking the monitor's wire protocol.
//!
//! Holds one persistent connection, lazily established and re-dialed
//! once per call if the previous connection dropped. Every failure
//! surfaces as a typed error; the guard resolves it through the
//! configured fallback, never implicitly.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use warden_core::protocol::{AnalyzeReply, AnalyzeRequest, ErrorReply};

use crate::{AnalysisReport, Analyzer, GuardError, Result};

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Connection {
    async fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(GuardError::BackendUnreachable)?;
        let (read, write) = stream.into_split();
        info!(%addr, "connected to monitor");
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    async fn round_trip(&mut self, request_line: &str) -> std::io::Result<Option<String>> {
        self.write.write_all(request_line.as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        self.write.flush().await?;
        self.lines.next_line().await
    }
}

/// Analyzer that delegates to a remote monitor over TCP.
pub struct RemoteAnalyzer {
    addr: String,
    connection: Mutex<Option<Connection>>,
}

impl RemoteAnalyzer {
    /// Creates an analyzer for the given "host:port" address. The
    /// connection is established on first use.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connection: Mutex::new(None),
        }
    }

    /// Returns the monitor address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn exchange(&self, request_line: &str) -> Result<String> {
        let mut slot = self.connection.lock().await;

        // One retry: a dropped persistent connection is re-dialed once
        // before the failure is surfaced.
        for attempt in 0..2 {
            if slot.is_none() {
                *slot = Some(Connection::dial(&self.addr).await?);
            }
            let connection = slot.as_mut().expect("connection dialed above");

            match connection.round_trip(request_line).await {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {
                    debug!(attempt, "monitor closed the connection");
                    *slot = None;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "monitor connection failed");
                    *slot = None;
                    if attempt == 1 {
                        return Err(GuardError::BackendUnreachable(e));
                    }
                }
            }
        }

        Err(GuardError::BackendUnreachable(std::io::Error::other(
            "monitor closed the connection",
        )))
    }
}

#[async_trait]
impl Analyzer for RemoteAnalyzer {
    async fn analyze(
        &self,
        session_id: &str,
        user_message: &str,
        model_response: &str,
    ) -> Result<AnalysisReport> {
        let request = AnalyzeRequest::new(session_id, user_message, model_response);
        let line = serde_json::to_string(&request)
            .map_err(|e| GuardError::Protocol(e.to_string()))?;

        let reply = self.exchange(&line).await?;

        if let Ok(parsed) = serde_json::from_str::<AnalyzeReply>(&reply) {
            return Ok(AnalysisReport {
                detections: parsed.detections,
                decision: parsed.decision,
            });
        }
        if let Ok(error) = serde_json::from_str::<ErrorReply>(&reply) {
            return Err(GuardError::Remote(error.error));
        }
        Err(GuardError::Protocol(format!(
            "unrecognized reply: {reply}"
        )))
    }
}
