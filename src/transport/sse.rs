//! Server-Sent Events client transport.
//!
//! Opens an event-stream GET against the backend URL and forwards the
//! configured header allow-list. The backend announces its message-post
//! endpoint in an `endpoint` event (the legacy MCP SSE handshake);
//! outbound messages are POSTed there. `message` events carry JSON-RPC
//! payloads inbound.

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::WharfError;
use crate::transport::{BackendConnection, TransportDefaults, TransportKind, TransportRequest};

/// One parsed SSE event: optional event name plus joined data lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE wire parser.
///
/// Feed it raw chunks; it yields complete events at each blank-line
/// boundary. Comment lines (leading `:`) and unknown fields are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes, returning any events completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.event = None;
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }
}

/// Resolve a possibly-relative endpoint path against the SSE base URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    // Scheme + authority from the base, path from the endpoint
    if let Some(scheme_end) = base.find("://") {
        let after_scheme = &base[scheme_end + 3..];
        let authority_end = after_scheme.find('/').map_or(base.len(), |i| scheme_end + 3 + i);
        let origin = &base[..authority_end];
        if endpoint.starts_with('/') {
            return format!("{origin}{endpoint}");
        }
        return format!("{origin}/{endpoint}");
    }
    endpoint.to_string()
}

/// Open an SSE backend connection.
pub(crate) async fn connect(
    request: &TransportRequest,
    defaults: &TransportDefaults,
) -> crate::Result<BackendConnection> {
    let url = request.url.clone().ok_or_else(|| {
        WharfError::ConnectFailed("sse".to_string(), "sse transport requires 'url'".to_string())
    })?;

    let client = reqwest::Client::new();
    let forwarded = defaults.filter_headers(&request.headers);

    let mut get = client.get(&url).header("accept", "text/event-stream");
    for (name, value) in &forwarded {
        get = get.header(name.as_str(), value.as_str());
    }

    let response = get
        .send()
        .await
        .map_err(|e| WharfError::ConnectFailed(url.clone(), e.to_string()))?;

    // 401 is reported distinctly so the caller can prompt for credentials
    // instead of treating this as a transient fault.
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(WharfError::AuthFailed(url.clone()));
    }
    if !response.status().is_success() {
        return Err(WharfError::ConnectFailed(
            url.clone(),
            format!("HTTP {}", response.status()),
        ));
    }

    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(32);
    let (incoming_tx, incoming_rx) = mpsc::channel::<Value>(64);
    let (endpoint_tx, endpoint_rx) = watch::channel::<Option<String>>(None);

    // Reader: event stream → incoming channel; the endpoint event feeds
    // the writer its POST target.
    let reader_cancel = cancel.clone();
    let reader_url = url.clone();
    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                maybe_chunk = stream.next() => {
                    let Some(chunk_result) = maybe_chunk else { break };
                    let Ok(chunk) = chunk_result else { break };
                    let text = String::from_utf8_lossy(&chunk);
                    for event in parser.push(&text) {
                        match event.event.as_deref() {
                            Some("endpoint") => {
                                let resolved = resolve_endpoint(&reader_url, event.data.trim());
                                tracing::debug!(endpoint = %resolved, "sse endpoint announced");
                                let _ = endpoint_tx.send(Some(resolved));
                            }
                            _ => match serde_json::from_str::<Value>(&event.data) {
                                Ok(msg) => {
                                    if incoming_tx.send(msg).await.is_err() {
                                        return;
                                    }
                                }
                                Err(_) => {
                                    tracing::debug!(
                                        url = %reader_url,
                                        "discarding non-JSON sse event"
                                    );
                                }
                            },
                        }
                    }
                }
                _ = reader_cancel.cancelled() => break,
            }
        }
    });

    // Writer: outbound messages → POST to the announced endpoint.
    let writer_cancel = cancel.clone();
    let writer_url = url.clone();
    let writer_client = client.clone();
    let writer_headers = forwarded.clone();
    tokio::spawn(async move {
        let mut endpoint_rx = endpoint_rx;
        loop {
            tokio::select! {
                maybe_msg = outbound_rx.recv() => {
                    let Some(msg) = maybe_msg else { break };
                    // Wait for the endpoint announcement before the first post.
                    let endpoint = loop {
                        if let Some(ep) = endpoint_rx.borrow().clone() {
                            break ep;
                        }
                        if endpoint_rx.changed().await.is_err() {
                            tracing::warn!(url = %writer_url, "sse stream closed before endpoint event");
                            return;
                        }
                    };
                    let mut post = writer_client.post(&endpoint).json(&msg);
                    for (name, value) in &writer_headers {
                        post = post.header(name.as_str(), value.as_str());
                    }
                    if let Err(e) = post.send().await {
                        tracing::warn!(endpoint = %endpoint, error = %e, "sse message post failed");
                    }
                }
                _ = writer_cancel.cancelled() => break,
            }
        }
    });

    tracing::info!(url = %url, "sse backend connection started");

    Ok(BackendConnection::new(
        TransportKind::Sse,
        url,
        outbound_tx,
        incoming_rx,
        None,
        cancel,
    ))
}
