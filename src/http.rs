use crate::aggregator::Aggregator;
use crate::metrics::Metrics;
use crate::push::Subscribers;
use crate::snapshot::Snapshot;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::header::{InvalidHeaderValue, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct HttpAppState {
    pub aggregator: Arc<Aggregator>,
    pub subscribers: Arc<Subscribers>,
    pub metrics: Arc<Metrics>,
    pub auth: Arc<AuthState>,
}

pub struct AuthState {
    secret: Option<String>,
    pub tokens: StreamTokens,
}

impl AuthState {
    pub fn new(secret: Option<String>, token_ttl: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.trim().is_empty()),
            tokens: StreamTokens::new(token_ttl),
        }
    }

    fn accepts(&self, provided: &str) -> bool {
        self.secret
            .as_deref()
            .is_some_and(|secret| constant_time_eq(provided.as_bytes(), secret.as_bytes()))
    }
}

/// Single-use, short-lived credentials for opening the push socket, so the
/// shared secret never has to travel in a URL.
pub struct StreamTokens {
    ttl: Duration,
    issued: Mutex<HashMap<String, Instant>>,
}

impl StreamTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.retain(|_, at| now.duration_since(*at) < self.ttl);
        issued.insert(token.clone(), now);
        token
    }

    pub fn redeem(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.retain(|_, at| now.duration_since(*at) < self.ttl);
        issued.remove(token).is_some()
    }
}

/// Browser dashboards on the listed origins may call every route with any
/// method and header. Credentials are not allowed.
pub fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, InvalidHeaderValue> {
    let origins = origins
        .iter()
        .map(|o| HeaderValue::from_str(o))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600)))
}

pub fn build_router(state: HttpAppState, cors: CorsLayer) -> Router {
    let protected = Router::new()
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stream/token", post(stream_token_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/stream", get(stream_handler))
        .merge(protected)
        .with_state(state)
        .layer(cors)
}

async fn require_api_key(
    State(state): State<HttpAppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.auth.secret.is_none() {
        return misconfigured();
    }
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !state.auth.accepts(provided) {
        debug!(path = %request.uri().path(), "отклонён запрос с неверным ключом");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    next.run(request).await
}

fn misconfigured() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "server error: api token not configured",
    )
        .into_response()
}

async fn health(State(state): State<HttpAppState>) -> impl IntoResponse {
    let message = if state.aggregator.is_available() {
        "hwmond is running"
    } else {
        "hwmond is running without a sensor provider"
    };
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "message": message,
    }))
}

async fn stats_handler(State(state): State<HttpAppState>) -> Response {
    match state.aggregator.poll().await {
        Ok(snapshot) => Json(Snapshot::clone(&snapshot)).into_response(),
        Err(err) => {
            error!(error = %err, "не удалось получить снимок для /stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "title": "Failed to collect hardware stats",
                    "detail": err.to_string(),
                    "status": 500,
                })),
            )
                .into_response()
        }
    }
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn stream_token_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let token = state.auth.tokens.issue();
    Json(json!({
        "token": token,
        "expiresInSecs": state.auth.tokens.ttl().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    token: Option<String>,
}

async fn stream_handler(
    State(state): State<HttpAppState>,
    Query(params): Query<StreamParams>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if state.auth.secret.is_none() {
        return misconfigured();
    }
    let authorized = params
        .token
        .as_deref()
        .is_some_and(|t| state.auth.tokens.redeem(t));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "expected websocket upgrade").into_response();
    };

    let subscribers = state.subscribers.clone();
    let aggregator = state.aggregator.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, subscribers, aggregator))
}

async fn handle_socket(
    socket: WebSocket,
    subscribers: Arc<Subscribers>,
    aggregator: Arc<Aggregator>,
) {
    let cached = aggregator.latest();
    let (conn_id, mut outbound) = subscribers.add().await;
    info!(conn_id = %conn_id, "push-подписчик подключён");
    let (mut sink, mut inbound) = socket.split();

    // Last known snapshot first, so a fresh client does not wait a full interval.
    if let Some(snapshot) = cached {
        match serde_json::to_string(&*snapshot) {
            Ok(json) => {
                if sink.send(Message::Text(json)).await.is_err() {
                    subscribers.remove(&conn_id).await;
                    return;
                }
            }
            Err(err) => warn!(error = %err, "не удалось сериализовать последний снимок"),
        }
    }

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if sink.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = inbound.next() => match msg {
                Some(Ok(Message::Text(text))) if text.trim() == "ping" => {
                    if sink.send(Message::Text("pong".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(conn_id = %conn_id, error = %err, "ошибка чтения из сокета");
                    break;
                }
            },
        }
    }

    subscribers.remove(&conn_id).await;
    info!(conn_id = %conn_id, "push-подписчик отключён");
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
