//! HTTP surface of the gateway — thin axum handlers over `Gateway`.
//!
//! The boundary stays logic-free: handlers parse parameters, call one
//! gateway operation, and map `WharfError` onto status codes. An auth
//! failure maps to 401 with a distinct code so desktop callers can prompt
//! for credentials instead of retrying.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::error::WharfError;
use crate::gateway::{BatchStartEntry, Gateway, OpenedSession};
use crate::transport::{TransportKind, TransportRequest};

const SESSION_HEADER: &str = "mcp-session-id";

type AppState = Arc<Gateway>;

/// Build the gateway router. CORS is wide open — the caller is a desktop
/// renderer on another origin.
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/mcp", get(mcp_get).post(mcp_post))
        .route("/stdio", get(stdio_open))
        .route("/sse", get(sse_open))
        .route("/message", post(message_relay))
        .route("/mcp/server/:id/stop", post(server_stop))
        .route("/mcp/batch-start", post(batch_start))
        .route("/mcp/batch-stop", post(batch_stop))
        .route("/mcp/active-servers", get(active_servers))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(gateway)
}

/// Map a `WharfError` onto an HTTP response.
fn error_response(error: &WharfError) -> Response {
    let (status, code) = match error {
        WharfError::AuthFailed(_) => (StatusCode::UNAUTHORIZED, "auth_required"),
        WharfError::SessionNotFound(_) | WharfError::ServerNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        WharfError::UnsupportedTransport(_) | WharfError::InvalidDescriptor(_, _) => {
            (StatusCode::BAD_REQUEST, "bad_request")
        }
        WharfError::ConnectFailed(_, _) | WharfError::RelayFailed(_, _) => {
            (StatusCode::BAD_GATEWAY, "connect_failed")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(json!({ "code": code, "error": error.to_string() })),
    )
        .into_response()
}

/// Turn an opened session into an SSE response carrying the session id
/// header, with the outbound channel as the event stream.
fn session_stream_response(opened: OpenedSession) -> Response {
    let stream = ReceiverStream::new(opened.outbound)
        .map(|msg| Ok::<Event, Infallible>(Event::default().data(msg.to_string())));
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    );

    let mut response = sse.into_response();
    match HeaderValue::from_str(&opened.session_id) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        Err(_) => {
            tracing::warn!(session = %opened.session_id, "session id not header-safe");
        }
    }
    response
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn config(State(gateway): State<AppState>) -> Json<Value> {
    let defaults = gateway.defaults();
    Json(json!({
        "allowedHeaders": defaults.allowed_headers,
        "defaultEnvKeys": defaults.env.keys().collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpQuery {
    url: Option<String>,
    server_name: Option<String>,
    /// Transport discriminator override; defaults to streamable-http.
    transport_type: Option<String>,
}

/// POST /mcp — create (no session header) or resume (header present) a
/// streamable-HTTP session. Creation opens the backing connection from the
/// query parameters and answers with the new session's event stream; the
/// posted body is relayed into the backend either way.
async fn mcp_post(
    State(gateway): State<AppState>,
    Query(query): Query<McpQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(session_id) = header_session_id(&headers) {
        return match gateway.relay(&session_id, body).await {
            Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response(),
            Err(e) => error_response(&e),
        };
    }

    let kind = match query.transport_type.as_deref() {
        None => TransportKind::StreamableHttp,
        Some(raw) => match raw.parse::<TransportKind>() {
            Ok(kind) => kind,
            Err(e) => return error_response(&e),
        },
    };

    let request = TransportRequest {
        server_name: query.server_name,
        url: query.url,
        headers: collect_forwardable_headers(&headers),
        ..Default::default()
    };
    let opened = match gateway.open_session(kind, request).await {
        Ok(opened) => opened,
        Err(e) => return error_response(&e),
    };

    if let Err(e) = gateway.relay(&opened.session_id, body).await {
        tracing::warn!(session = %opened.session_id, error = %e, "initial message relay failed");
    }
    session_stream_response(opened)
}

/// GET /mcp — resume lookup for an existing streamable-HTTP session.
/// The message stream rides the creating POST; this endpoint confirms the
/// session is alive (or 404s), which is what desktop reconnect logic polls.
async fn mcp_get(State(gateway): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_session_id(&headers) else {
        return error_response(&WharfError::SessionNotFound("<missing header>".to_string()));
    };
    match gateway.resume_session(&session_id).await {
        Ok(session) => Json(json!({
            "sessionId": session.id,
            "serverName": session.server_name,
            "transportType": session.kind,
            "active": true,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StdioQuery {
    command: String,
    args: Option<String>,
    /// JSON object of environment overrides, URL-encoded.
    env: Option<String>,
    server_name: Option<String>,
}

/// GET /stdio — open a stdio-backed session. The new id travels back in
/// the `mcp-session-id` response header; the body is the session's event
/// stream, including `notifications/stderr` wrappers.
async fn stdio_open(State(gateway): State<AppState>, Query(query): Query<StdioQuery>) -> Response {
    let env: HashMap<String, String> = match query.env.as_deref() {
        None | Some("") => HashMap::new(),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(env) => env,
            Err(e) => {
                return error_response(&WharfError::InvalidDescriptor(
                    "stdio".to_string(),
                    format!("env must be a JSON object: {e}"),
                ));
            }
        },
    };

    let request = TransportRequest {
        server_name: query.server_name,
        command: Some(query.command),
        args: query.args,
        env,
        url: None,
        headers: HashMap::new(),
    };
    match gateway.open_session(TransportKind::Stdio, request).await {
        Ok(opened) => session_stream_response(opened),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SseQuery {
    url: String,
    server_name: Option<String>,
}

/// GET /sse — legacy direct SSE session against a caller-supplied URL.
async fn sse_open(
    State(gateway): State<AppState>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> Response {
    let request = TransportRequest {
        server_name: query.server_name,
        url: Some(query.url),
        headers: collect_forwardable_headers(&headers),
        ..Default::default()
    };
    match gateway.open_session(TransportKind::Sse, request).await {
        Ok(opened) => session_stream_response(opened),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: String,
}

/// POST /message?sessionId= — relay one message into an existing session.
async fn message_relay(
    State(gateway): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(body): Json<Value>,
) -> Response {
    match gateway.relay(&query.session_id, body).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /mcp/server/:id/stop — close a server's sessions and stop its
/// runtime instance.
async fn server_stop(State(gateway): State<AppState>, Path(id): Path<String>) -> Response {
    let removed = gateway.close_server_sessions(&id).await;
    if let Err(e) = gateway.registry().stop(&id).await {
        tracing::debug!(server = %id, error = %e, "registry stop on session close");
    }
    Json(json!({ "serverId": id, "sessionsRemoved": removed })).into_response()
}

async fn batch_start(
    State(gateway): State<AppState>,
    Json(entries): Json<Vec<BatchStartEntry>>,
) -> Response {
    let summary = gateway.batch_start(entries).await;
    Json(summary).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchStopBody {
    server_names: Vec<String>,
}

async fn batch_stop(
    State(gateway): State<AppState>,
    Json(body): Json<BatchStopBody>,
) -> Response {
    let summary = gateway.batch_stop(body.server_names).await;
    Json(summary).into_response()
}

async fn active_servers(State(gateway): State<AppState>) -> Json<Value> {
    let servers = gateway.active_servers().await;
    let total: usize = servers.values().sum();
    Json(json!({ "servers": servers, "totalSessions": total }))
}

fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Collect string-valued request headers for the transport allow-list to
/// filter. Binary header values are skipped.
fn collect_forwardable_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::transport::TransportDefaults;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn make_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(GatewayConfig {
            install_root: dir.path().join("servers"),
            store_path: dir.path().join("servers.json"),
            defaults: TransportDefaults::default(),
        })
        .await
        .unwrap();
        let app = create_router(Arc::new(gateway));
        (dir, app)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_config_endpoint_lists_allowed_headers() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(Request::builder().uri("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["allowedHeaders"]
            .as_array()
            .unwrap()
            .iter()
            .any(|h| h == "authorization"));
    }

    #[tokio::test]
    async fn test_message_unknown_session_is_404() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/message?sessionId=weather-nope")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_mcp_get_without_header_is_404() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(Request::builder().uri("/mcp").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_open_returns_session_header() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stdio?command=sleep&args=30&serverName=weather")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .expect("session id header")
            .to_str()
            .unwrap();
        assert!(session_id.starts_with("weather-"));
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
    }

    #[tokio::test]
    async fn test_stdio_open_bad_command_is_500() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stdio?command=%2Fthis%2Fdoes%2Fnot%2Fexist-wharf")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_mcp_post_unsupported_transport_is_400() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp?transportType=websocket&url=http://localhost:1/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","method":"initialize","id":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("unsupported transport type 'websocket'"));
    }

    #[tokio::test]
    async fn test_active_servers_empty() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/mcp/active-servers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["totalSessions"], 0);
    }

    #[tokio::test]
    async fn test_batch_stop_reports_counts() {
        let (_dir, app) = make_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp/batch-stop")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"serverNames":["a","b"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["failed"], 0);
        assert_eq!(body["results"][0]["sessionsRemoved"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_stop_closes_sessions() {
        let (_dir, app) = make_app().await;

        // Open a session, then stop the server through the boundary.
        let open = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/stdio?command=sleep&args=30&serverName=weather")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(open.status(), StatusCode::OK);

        let stop = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp/server/weather/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(stop).await;
        assert_eq!(body["serverId"], "weather");
        assert_eq!(body["sessionsRemoved"], 1);
    }
}
