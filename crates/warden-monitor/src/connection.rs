//! Per-connection handling.
//!
//! Each connection runs its own task and owns its session's happy
//! path: receive a line, evaluate, record, decide, dispatch, reply.
//! Nothing a single message does can take the connection down, and
//! nothing a single connection does can take the server down.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use warden_core::dispatch::AlertEvent;
use warden_core::protocol::{AnalyzeReply, AnalyzeRequest, ErrorReply};

use crate::MonitorState;

/// Drives one connection from accept to disconnect.
pub(crate) async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: MonitorState) {
    state.connections.fetch_add(1, Ordering::Relaxed);
    info!(%peer, "connection established");

    // The connection's default session, used when a request carries no
    // conversation id of its own.
    let default_session = state.registry.open(None);
    let mut sessions_seen: HashSet<String> = HashSet::new();
    sessions_seen.insert(default_session.clone());

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(%peer, "connection closed by client");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "connection read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<AnalyzeRequest>(&line) {
            Ok(request) => {
                process_request(&state, &default_session, &mut sessions_seen, request).await
            }
            Err(e) => {
                warn!(%peer, error = %e, "invalid JSON received");
                serde_json::to_string(&ErrorReply::invalid_json()).expect("reply serializes")
            }
        };

        if let Err(e) = write_reply(&mut write_half, &reply).await {
            warn!(%peer, error = %e, "connection write failed");
            break;
        }
    }

    // Flush the connection's final contribution: every session touched
    // here is closed so no orphaned per-connection state survives.
    for session_id in &sessions_seen {
        state.registry.close(session_id);
    }
    state.connections.fetch_sub(1, Ordering::Relaxed);
    debug!(%peer, "connection task finished");
}

/// Processes one parsed request and renders the reply line.
///
/// A failure while recording or dispatching is reported as an error
/// payload; the connection stays active either way.
async fn process_request(
    state: &MonitorState,
    default_session: &str,
    sessions_seen: &mut HashSet<String>,
    request: AnalyzeRequest,
) -> String {
    let session_id = request
        .conversation_id
        .clone()
        .unwrap_or_else(|| default_session.to_string());

    // First sight of a client-supplied id on this connection: create or
    // resume it through the registry.
    if sessions_seen.insert(session_id.clone()) {
        state.registry.open(Some(&session_id));
    }

    let detections = state
        .engine
        .evaluate(&request.user_message, &request.model_response);

    if let Err(e) = state.registry.record_turn(
        &session_id,
        &request.user_message,
        &request.model_response,
        detections.clone(),
    ) {
        warn!(session_id = %session_id, error = %e, "failed to record turn");
        return serde_json::to_string(&ErrorReply::server_error(e)).expect("reply serializes");
    }

    let decision = state.dispatcher.decide(&detections);
    if !detections.is_empty() {
        warn!(
            session_id = %session_id,
            detections = detections.len(),
            action = decision.action.name(),
            "policy violations detected"
        );
        let event = AlertEvent::new(session_id.clone(), decision.clone(), detections.clone());
        state.dispatcher.dispatch(&event).await;
    }

    let reply = AnalyzeReply::new(session_id, detections, decision);
    serde_json::to_string(&reply).expect("reply serializes")
}

async fn write_reply(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    reply: &str,
) -> std::io::Result<()> {
    write_half.write_all(reply.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await
}
