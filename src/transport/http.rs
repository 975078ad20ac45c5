//! Streamable HTTP client transport.
//!
//! Each outbound JSON-RPC message is POSTed to the backend endpoint with
//! the configured header allow-list. The backend may answer a POST with a
//! plain JSON body or an event stream; both are drained into the inbound
//! channel. The backend's `mcp-session-id` header is captured from the
//! first response and replayed on every subsequent request.

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::WharfError;
use crate::transport::sse::SseParser;
use crate::transport::{BackendConnection, TransportDefaults, TransportKind, TransportRequest};

const SESSION_HEADER: &str = "mcp-session-id";

/// Open a streamable-HTTP backend connection.
///
/// Start is a probing GET against the endpoint: a 401 fails distinctly as
/// `AuthFailed`, an unreachable host as `ConnectFailed`. Backends that
/// only accept POST (405/404 on GET) still pass — the GET stream is an
/// optional half of the protocol.
pub(crate) async fn connect(
    request: &TransportRequest,
    defaults: &TransportDefaults,
) -> crate::Result<BackendConnection> {
    let url = request.url.clone().ok_or_else(|| {
        WharfError::ConnectFailed(
            "streamable-http".to_string(),
            "streamable-http transport requires 'url'".to_string(),
        )
    })?;

    let client = reqwest::Client::new();
    let forwarded = defaults.filter_headers(&request.headers);

    let mut get = client.get(&url).header("accept", "text/event-stream");
    for (name, value) in &forwarded {
        get = get.header(name.as_str(), value.as_str());
    }
    let probe = get
        .send()
        .await
        .map_err(|e| WharfError::ConnectFailed(url.clone(), e.to_string()))?;

    if probe.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(WharfError::AuthFailed(url.clone()));
    }

    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(32);
    let (incoming_tx, incoming_rx) = mpsc::channel::<Value>(64);

    let mut session_id: Option<String> = probe
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    // A successful GET with an event-stream body is the server-push half;
    // drain it alongside the POST responses.
    let streaming_get = probe.status().is_success()
        && probe
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
    if streaming_get {
        let incoming = incoming_tx.clone();
        let stream_cancel = cancel.clone();
        let stream_url = url.clone();
        tokio::spawn(async move {
            drain_event_stream(probe, incoming, stream_cancel, stream_url).await;
        });
    } else {
        tracing::debug!(url = %url, status = %probe.status(), "no server-push stream on GET");
    }

    // Writer: POST each message, feeding responses back inbound.
    let writer_cancel = cancel.clone();
    let writer_url = url.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_msg = outbound_rx.recv() => {
                    let Some(msg) = maybe_msg else { break };
                    let mut post = client
                        .post(&writer_url)
                        .header("accept", "application/json, text/event-stream")
                        .json(&msg);
                    for (name, value) in &forwarded {
                        post = post.header(name.as_str(), value.as_str());
                    }
                    if let Some(id) = &session_id {
                        post = post.header(SESSION_HEADER, id);
                    }
                    let response = match post.send().await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::warn!(url = %writer_url, error = %e, "message post failed");
                            continue;
                        }
                    };
                    if let Some(id) = response
                        .headers()
                        .get(SESSION_HEADER)
                        .and_then(|v| v.to_str().ok())
                    {
                        session_id = Some(id.to_string());
                    }
                    if !response.status().is_success() {
                        tracing::warn!(
                            url = %writer_url,
                            status = %response.status(),
                            "backend rejected message"
                        );
                        continue;
                    }
                    let content_type = response
                        .headers()
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if content_type.starts_with("text/event-stream") {
                        drain_event_stream(
                            response,
                            incoming_tx.clone(),
                            writer_cancel.clone(),
                            writer_url.clone(),
                        )
                        .await;
                    } else if content_type.starts_with("application/json") {
                        match response.json::<Value>().await {
                            Ok(body) => {
                                if incoming_tx.send(body).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(url = %writer_url, error = %e, "bad JSON response body");
                            }
                        }
                    }
                    // 202-with-no-body responses fall through silently
                }
                _ = writer_cancel.cancelled() => break,
            }
        }
    });

    tracing::info!(url = %url, "streamable-http backend connection started");

    Ok(BackendConnection::new(
        TransportKind::StreamableHttp,
        url,
        outbound_tx,
        incoming_rx,
        None,
        cancel,
    ))
}

/// Drain an event-stream response body into the inbound channel.
async fn drain_event_stream(
    response: reqwest::Response,
    incoming_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
    url: String,
) {
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            maybe_chunk = stream.next() => {
                let Some(chunk_result) = maybe_chunk else { break };
                let Ok(chunk) = chunk_result else { break };
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.push(&text) {
                    match serde_json::from_str::<Value>(&event.data) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            tracing::debug!(url = %url, "discarding non-JSON stream event");
                        }
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
