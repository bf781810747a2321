// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP front end of the collector.
//!
//! - `POST /ingest` - text, bytes or JSON (generic or OTLP)
//! - `GET /stream` - server-sent events feed of accepted records
//! - `GET /socket` - WebSocket feed of accepted records
//! - `GET /buckets` - minute-bucket rollups
//! - `GET /recent` - newest records of one kind
//! - `GET /counts` - ring buffer occupancy
//! - `POST /clear` - empties the ring buffers
//! - `GET /correlations`, `GET /correlations/{key}` - correlation groups
//! - `GET /health`

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use telemetry_pipeline::{
    aggregator::BucketQuery,
    broadcast::{BroadcastRegistry, StreamMessage, Subscription, Transport},
    constants::MINUTE_MS,
    errors::{IngestError, ServiceError},
    ingest::{IngestInput, IngestResponse, Ingestor},
    pipeline_service::{PipelineHandle, PipelineService},
    record::RecordKind,
    util::{now_ms, parse_timestamp},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::CollectorError;
use crate::http_utils::{
    content_type, handler_not_found, is_json_media, is_text_media, log_and_create_http_response,
};

const INGEST_ENDPOINT_PATH: &str = "/ingest";
const STREAM_ENDPOINT_PATH: &str = "/stream";
const SOCKET_ENDPOINT_PATH: &str = "/socket";
const BUCKETS_ENDPOINT_PATH: &str = "/buckets";
const RECENT_ENDPOINT_PATH: &str = "/recent";
const COUNTS_ENDPOINT_PATH: &str = "/counts";
const CLEAR_ENDPOINT_PATH: &str = "/clear";
const HEALTH_ENDPOINT_PATH: &str = "/health";
const CORRELATIONS_ENDPOINT_PATH: &str = "/correlations";
const CORRELATION_ENDPOINT_PATH: &str = "/correlations/{key}";

const STREAM_KEEP_ALIVE: Duration = Duration::from_secs(15);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_QUERY_RANGE_MINUTES: i64 = 60;
const DEFAULT_STEP_MINUTES: i64 = 1;
const DEFAULT_TOP_N_PATHS: usize = 5;

/// Everything a handler needs, cloned into each request.
#[derive(Debug, Clone)]
pub struct AppState {
    ingestor: Ingestor,
    registry: BroadcastRegistry,
    shutdown_token: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(
        ingestor: Ingestor,
        registry: BroadcastRegistry,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            ingestor,
            registry,
            shutdown_token,
        }
    }

    /// Builds the pipeline for `config`. The returned service must be spawned.
    #[must_use]
    pub fn from_config(
        config: &Config,
        shutdown_token: CancellationToken,
    ) -> (Self, PipelineService) {
        let registry = BroadcastRegistry::new(config.subscriber_queue_capacity);
        let (service, handle) = PipelineService::new(config.pipeline_config(), registry.clone());
        let ingestor = Ingestor::new(handle, config.log_transformer.build());
        (Self::new(ingestor, registry, shutdown_token), service)
    }

    #[must_use]
    pub const fn handle(&self) -> &PipelineHandle {
        self.ingestor.handle()
    }

    #[must_use]
    pub const fn registry(&self) -> &BroadcastRegistry {
        &self.registry
    }
}

pub fn make_router(state: AppState, max_body_bytes: usize) -> Router {
    let ingest_router = Router::new()
        .route(INGEST_ENDPOINT_PATH, post(ingest))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state.clone());

    let live_router = Router::new()
        .route(STREAM_ENDPOINT_PATH, get(stream_records))
        .route(SOCKET_ENDPOINT_PATH, get(socket_records))
        .with_state(state.clone());

    let query_router = Router::new()
        .route(BUCKETS_ENDPOINT_PATH, get(buckets))
        .route(RECENT_ENDPOINT_PATH, get(recent))
        .route(COUNTS_ENDPOINT_PATH, get(counts))
        .route(CLEAR_ENDPOINT_PATH, post(clear))
        .route(CORRELATIONS_ENDPOINT_PATH, get(correlations))
        .route(CORRELATION_ENDPOINT_PATH, get(correlation))
        .route(HEALTH_ENDPOINT_PATH, get(health))
        .with_state(state);

    Router::new()
        .merge(ingest_router)
        .merge(live_router)
        .merge(query_router)
        .fallback(handler_not_found)
        // Disable the default body limit so we can use our own limit
        .layer(DefaultBodyLimit::disable())
}

/// Binds the configured address and serves until `shutdown_token` is
/// cancelled.
pub async fn run(config: Config, shutdown_token: CancellationToken) -> Result<(), CollectorError> {
    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| CollectorError::Bind { address, source })?;
    run_with_listener(config, listener, shutdown_token).await
}

pub async fn run_with_listener(
    config: Config,
    listener: TcpListener,
    shutdown_token: CancellationToken,
) -> Result<(), CollectorError> {
    let (state, service) = AppState::from_config(&config, shutdown_token.clone());
    tokio::spawn(service.run());
    tokio::spawn(prune_buckets(
        state.handle().clone(),
        config.retention_ms(),
        PRUNE_INTERVAL,
        shutdown_token.clone(),
    ));

    let handle = state.handle().clone();
    let router = make_router(state, config.max_body_bytes);
    if let Ok(address) = listener.local_addr() {
        info!("Telemetry collector listening on {address}");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(graceful_shutdown(shutdown_token))
        .await?;

    if handle.shutdown().is_err() {
        debug!("Pipeline service already stopped");
    }
    Ok(())
}

async fn graceful_shutdown(shutdown_token: CancellationToken) {
    shutdown_token.cancelled().await;
    debug!("Shutdown signal received, shutting down");
}

/// Periodically drops minute buckets older than `retention_ms`.
pub async fn prune_buckets(
    handle: PipelineHandle,
    retention_ms: i64,
    period: Duration,
    shutdown_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            _ = interval.tick() => {
                match handle.prune(now_ms().saturating_sub(retention_ms)).await {
                    Ok(0) => {}
                    Ok(removed) => debug!("Pruned {removed} minute buckets"),
                    Err(e) => {
                        error!("Stopping bucket pruning: {e}");
                        break;
                    }
                }
            }
        }
    }
}

fn service_unavailable(e: &ServiceError) -> Response {
    log_and_create_http_response(
        &format!("Pipeline unavailable: {e}"),
        StatusCode::SERVICE_UNAVAILABLE,
    )
}

/// Picks the ingest input shape from the declared media type. Bodies
/// without one are sniffed for JSON.
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<IngestInput, String> {
    match content_type(headers) {
        Some(media) if is_json_media(&media) => serde_json::from_slice::<Value>(&body)
            .map(IngestInput::Json)
            .map_err(|e| format!("Invalid JSON body: {e}")),
        Some(media) if is_text_media(&media) => Ok(match String::from_utf8(body.to_vec()) {
            Ok(text) => IngestInput::Text(text),
            Err(e) => IngestInput::Binary(e.into_bytes()),
        }),
        Some(_) => Ok(IngestInput::Binary(body.to_vec())),
        None => {
            let looks_like_json = body
                .iter()
                .find(|b| !b.is_ascii_whitespace())
                .is_some_and(|b| *b == b'{' || *b == b'[');
            if looks_like_json {
                if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                    return Ok(IngestInput::Json(value));
                }
            }
            Ok(IngestInput::Binary(body.to_vec()))
        }
    }
}

async fn ingest(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let input = match decode_body(&headers, body) {
        Ok(input) => input,
        Err(message) => {
            warn!("Rejected ingest: {message}");
            return (
                StatusCode::BAD_REQUEST,
                Json(IngestResponse::rejected(message)),
            )
                .into_response();
        }
    };

    match state.ingestor.try_ingest(input).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            let status = match e {
                IngestError::Service(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            warn!("Rejected ingest: {e}");
            (status, Json(IngestResponse::rejected(e.to_string()))).into_response()
        }
    }
}

/// Waits for the next message, or `None` once the subscription or the
/// server is done.
async fn next_message(
    subscription: &mut Subscription,
    shutdown_token: &CancellationToken,
) -> Option<StreamMessage> {
    tokio::select! {
        () = shutdown_token.cancelled() => None,
        message = subscription.recv() => message,
    }
}

fn record_events(
    subscription: Subscription,
    shutdown_token: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(
        (subscription, shutdown_token),
        |(mut subscription, shutdown_token)| async move {
            loop {
                let message = next_message(&mut subscription, &shutdown_token).await?;
                match message.to_json() {
                    Ok(data) => {
                        let event = Ok::<_, Infallible>(Event::default().data(data));
                        return Some((event, (subscription, shutdown_token)));
                    }
                    Err(e) => error!("Failed to serialize stream message: {e}"),
                }
            }
        },
    )
}

async fn stream_records(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.registry.register(Transport::Push);
    debug!("Stream subscriber {} connected", subscription.id());
    Sse::new(record_events(subscription, state.shutdown_token))
        .keep_alive(KeepAlive::new().interval(STREAM_KEEP_ALIVE))
}

async fn socket_records(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state.registry, state.shutdown_token))
}

async fn serve_socket(
    mut socket: WebSocket,
    registry: BroadcastRegistry,
    shutdown_token: CancellationToken,
) {
    let mut subscription = registry.register(Transport::Socket);
    let id = subscription.id();
    debug!("Socket subscriber {id} connected");

    loop {
        tokio::select! {
            message = next_message(&mut subscription, &shutdown_token) => {
                let Some(message) = message else {
                    if let Err(e) = socket.send(WsMessage::Close(None)).await {
                        debug!("Socket subscriber {id} close failed: {e}");
                    }
                    break;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize stream message: {e}");
                        continue;
                    }
                };
                if let Err(e) = socket.send(WsMessage::Text(text.into())).await {
                    debug!("Socket subscriber {id} send failed: {e}");
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                // Inbound frames carry no commands.
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    drop(subscription);
    debug!("Socket subscriber {id} disconnected");
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketParams {
    from: Option<String>,
    to: Option<String>,
    step_minutes: Option<String>,
    top_n_paths: Option<String>,
}

impl BucketParams {
    fn into_query(self, now: i64) -> Result<BucketQuery, String> {
        let to = match self.to {
            Some(to) => parse_time("to", &to)?,
            None => now,
        };
        let from = match self.from {
            Some(from) => parse_time("from", &from)?,
            None => to.saturating_sub(DEFAULT_QUERY_RANGE_MINUTES * MINUTE_MS),
        };
        let step_minutes = match self.step_minutes {
            Some(step) => parse_number("stepMinutes", &step)?,
            None => DEFAULT_STEP_MINUTES,
        };
        let top_n_paths = match self.top_n_paths {
            Some(top) => parse_number("topNPaths", &top)?,
            None => DEFAULT_TOP_N_PATHS,
        };
        Ok(BucketQuery {
            from,
            to,
            step_minutes,
            top_n_paths,
        })
    }
}

fn parse_time(name: &str, value: &str) -> Result<i64, String> {
    parse_timestamp(&Value::String(value.to_string()))
        .ok_or_else(|| format!("Invalid {name}: {value}"))
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("Invalid {name}: {value}"))
}

async fn buckets(State(state): State<AppState>, Query(params): Query<BucketParams>) -> Response {
    let query = match params.into_query(now_ms()) {
        Ok(query) => query,
        Err(message) => return log_and_create_http_response(&message, StatusCode::BAD_REQUEST),
    };
    match state.handle().buckets(query).await {
        Ok(points) => Json(points).into_response(),
        Err(ServiceError::Query(e)) => {
            log_and_create_http_response(&e.to_string(), StatusCode::BAD_REQUEST)
        }
        Err(e) => service_unavailable(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecentParams {
    kind: Option<String>,
    limit: Option<String>,
}

async fn recent(State(state): State<AppState>, Query(params): Query<RecentParams>) -> Response {
    let Some(kind) = params.kind else {
        return log_and_create_http_response(
            "Missing kind query parameter",
            StatusCode::BAD_REQUEST,
        );
    };
    let kind = match kind.parse::<RecordKind>() {
        Ok(kind) => kind,
        Err(e) => return log_and_create_http_response(&e.to_string(), StatusCode::NOT_FOUND),
    };
    let limit = match params.limit.as_deref().map(|l| parse_number::<usize>("limit", l)) {
        Some(Ok(limit)) => Some(limit),
        Some(Err(message)) => {
            return log_and_create_http_response(&message, StatusCode::BAD_REQUEST)
        }
        None => None,
    };
    match state.handle().recent(kind, limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => service_unavailable(&e),
    }
}

async fn counts(State(state): State<AppState>) -> Response {
    match state.handle().counts().await {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => service_unavailable(&e),
    }
}

async fn clear(State(state): State<AppState>) -> Response {
    match state.handle().clear().await {
        Ok(removed) => {
            info!("Cleared {removed} records");
            Json(json!({ "removed": removed })).into_response()
        }
        Err(e) => service_unavailable(&e),
    }
}

async fn correlations(State(state): State<AppState>) -> Response {
    match state.handle().correlation_groups().await {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => service_unavailable(&e),
    }
}

async fn correlation(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.handle().correlation(&key).await {
        Ok(Some(group)) => Json(group).into_response(),
        Ok(None) => log_and_create_http_response(
            &format!("Unknown correlation key: {key}"),
            StatusCode::NOT_FOUND,
        ),
        Err(e) => service_unavailable(&e),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "subscribers": {
            "stream": state.registry.push_count(),
            "socket": state.registry.socket_count(),
        },
        "droppedMessages": state.registry.dropped_total(),
    }))
    .into_response()
}
