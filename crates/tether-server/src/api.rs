//! HTTP routes and the WebSocket attach endpoint.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use tether_pty::{LaunchSpec, PtyError, SessionId, SessionSummary};

use crate::handler::{self, Transport};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/by-key/:key", get(get_session_by_key))
        .route("/sessions/:id", get(get_session).delete(close_session))
        .route("/sessions/:id/attach", get(attach))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub business_key: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl CreateSessionRequest {
    fn launch_spec(&self) -> LaunchSpec {
        let mut spec = LaunchSpec::new(self.command.iter().cloned());
        spec.cwd = self.cwd.clone();
        spec.env = self.env.clone();
        spec.rows = self.rows.unwrap_or(spec.rows);
        spec.cols = self.cols.unwrap_or(spec.cols);
        spec
    }
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

/// Errors returned by the HTTP handlers as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("session not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Launch(#[from] PtyError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Launch(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list())
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    if request.business_key.trim().is_empty() {
        return Err(ApiError::BadRequest("business_key must not be empty".into()));
    }
    if request.rows == Some(0) || request.cols == Some(0) {
        return Err(ApiError::BadRequest("rows and cols must be greater than zero".into()));
    }
    let spec = request.launch_spec();
    let session_id = state
        .registry
        .start_session(&request.business_key, &spec)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session_id })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = state.registry.get(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(session.summary()))
}

async fn get_session_by_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = state
        .registry
        .get_by_business_key(&key)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(session.summary()))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.close(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

async fn attach(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.registry.get(&id).is_none() {
        return Err(ApiError::NotFound);
    }
    Ok(ws
        .on_upgrade(move |socket| async move {
            let mut transport = WsTransport::new(socket);
            handler::serve(&state.registry, &id, &mut transport, &state.handler).await;
            transport.close().await;
        })
        .into_response())
}

/// [`Transport`] over an axum WebSocket.
///
/// Text frames carry JSON messages. Binary frames are raw input bytes.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }

    async fn close(mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&mut self) -> Option<Result<ClientMessage, ProtocolError>> {
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ProtocolError::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(ClientMessage::from_json(&text)),
                Message::Binary(data) => return Some(Ok(ClientMessage::Input { data })),
                Message::Close(_) => return None,
                // axum answers pings itself.
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), ProtocolError> {
        let text = message.to_json()?;
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tether_pty::{RegistryConfig, SessionRegistry};
    use tower::ServiceExt;

    use crate::handler::HandlerSettings;

    fn app() -> (Router, SessionRegistry) {
        let registry = SessionRegistry::new(RegistryConfig {
            grace_period: Duration::from_millis(500),
            ..RegistryConfig::default()
        });
        let state = AppState::new(registry.clone(), HandlerSettings::default());
        (router(state), registry)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_lifecycle_over_http() {
        let (app, registry) = app();
        let create = serde_json::json!({
            "business_key": "task-42",
            "command": ["cat"],
            "rows": 30,
            "cols": 100,
        });

        let (status, body) = call(&app, Method::POST, "/sessions", Some(create.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["session_id"].as_str().unwrap().to_string();

        // Same business key reuses the running session.
        let (_, again) = call(&app, Method::POST, "/sessions", Some(create)).await;
        assert_eq!(again["session_id"], id.as_str());

        let (status, summary) = call(&app, Method::GET, &format!("/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["business_key"], "task-42");
        assert_eq!(summary["rows"], 30);
        assert_eq!(summary["cols"], 100);

        let (status, by_key) = call(&app, Method::GET, "/sessions/by-key/task-42", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_key["session_id"], id.as_str());

        let (_, list) = call(&app, Method::GET, "/sessions", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::DELETE, &format!("/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, Method::GET, &format!("/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "session not found");
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_errors() {
        let (app, registry) = app();

        let missing = serde_json::json!({
            "business_key": "broken",
            "command": ["/definitely/not/a/real/binary"],
        });
        let (status, body) = call(&app, Method::POST, "/sessions", Some(missing)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("failed to launch"));

        let empty_key = serde_json::json!({ "business_key": " ", "command": ["cat"] });
        let (status, _) = call(&app, Method::POST, "/sessions", Some(empty_key)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let zero_rows = serde_json::json!({ "business_key": "z", "command": ["cat"], "rows": 0 });
        let (status, _) = call(&app, Method::POST, "/sessions", Some(zero_rows)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_404() {
        let (app, _registry) = app();
        for (method, uri) in [
            (Method::GET, "/sessions/missing"),
            (Method::GET, "/sessions/by-key/missing"),
            (Method::DELETE, "/sessions/missing"),
        ] {
            let (status, _) = call(&app, method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn serve_app(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn next_server_message(ws: &mut WsClient) -> ServerMessage {
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            match frame {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    async fn ws_output_until(ws: &mut WsClient, needle: &str) {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match next_server_message(ws).await {
                ServerMessage::Output { data } => seen.push_str(&String::from_utf8_lossy(&data)),
                other => panic!("unexpected {other:?} while waiting for {needle:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_websocket_attach() {
        use futures::SinkExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let (app, registry) = app();
        let id = registry.start_session("ws", &LaunchSpec::new(["cat"])).await.unwrap();
        let addr = serve_app(app).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/sessions/{id}/attach"))
            .await
            .unwrap();
        assert!(matches!(next_server_message(&mut ws).await, ServerMessage::Replay { .. }));

        // Binary frames are raw input.
        ws.send(WsMessage::Binary(b"from-binary\n".to_vec())).await.unwrap();
        ws_output_until(&mut ws, "from-binary").await;

        // Text frames are JSON messages; "ZnJvbS10ZXh0Cg==" is "from-text\n".
        let input = r#"{"type":"input","data":"ZnJvbS10ZXh0Cg=="}"#;
        ws.send(WsMessage::Text(input.to_string())).await.unwrap();
        ws_output_until(&mut ws, "from-text").await;

        ws.send(WsMessage::Text("garbage".to_string())).await.unwrap();
        assert!(matches!(next_server_message(&mut ws).await, ServerMessage::Rejected { .. }));

        let session = registry.get(&id).unwrap();
        assert_eq!(session.attached_clients(), 1);
        ws.send(WsMessage::Close(None)).await.unwrap();
        let mut detached = false;
        for _ in 0..100 {
            if session.attached_clients() == 0 {
                detached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(detached, "closing the socket should end the connection");
        assert!(session.pty().is_alive());
        assert!(registry.get(&id).is_some());

        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_websocket_attach_unknown_session_is_404() {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let (app, _registry) = app();
        let addr = serve_app(app).await;
        match tokio_tungstenite::connect_async(format!("ws://{addr}/sessions/missing/attach")).await {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 404),
            Err(other) => panic!("expected an HTTP error, got {other}"),
            Ok(_) => panic!("attaching to an unknown session should fail"),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _registry) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }
}
