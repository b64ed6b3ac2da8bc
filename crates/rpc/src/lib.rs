//! HTTP and WebSocket front for the EtherSim shared bus

mod error;
mod state;

pub use error::{ApiError, ErrorBody};
pub use state::{run_driver, BusUpdate, SharedState};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use ethersim_bus::{BusStats, LogEntry, Station};
use ethersim_core::{BackoffWindow, StationId, Transmission, TransmissionId, TransmissionStatus};

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 500;
/// Log entries replayed to a WebSocket client on connect.
const WS_BACKLOG: usize = 50;

#[derive(Deserialize, Debug)]
pub struct CommunicateRequest {
    pub start: i64,
    pub end: i64,
    pub msg: String,
}

/// Outcome of a transmission as the browser front-end expects it.
///
/// `backoff_times` is null when the frame got through on its first attempt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommunicateResponse {
    pub message: String,
    pub backoff_times: Option<BackoffWindow>,
    pub id: TransmissionId,
    pub status: TransmissionStatus,
    pub attempts: u32,
}

impl CommunicateResponse {
    pub fn from_outcome(t: &Transmission) -> Self {
        let message = match t.status() {
            TransmissionStatus::Delivered => {
                format!("Packet from PC {} successfully received by PC {}", t.sender, t.receiver)
            }
            TransmissionStatus::Failed => format!(
                "Transmission from PC {} to PC {} failed after {} attempts",
                t.sender,
                t.receiver,
                t.attempts()
            ),
            TransmissionStatus::Cancelled => {
                format!("Transmission from PC {} to PC {} was cancelled", t.sender, t.receiver)
            }
            other => format!("Transmission from PC {} to PC {} is {}", t.sender, t.receiver, other),
        };
        Self {
            message,
            backoff_times: t.first_collision(),
            id: t.id,
            status: t.status(),
            attempts: t.attempts(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SubmitResponse {
    pub id: TransmissionId,
    pub status: TransmissionStatus,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TransmissionView {
    pub id: TransmissionId,
    pub sender: StationId,
    pub receiver: StationId,
    pub payload: String,
    pub status: TransmissionStatus,
    pub attempts: u32,
    pub created_at: f64,
    pub resume_at: Option<f64>,
    pub backoff_times: Option<BackoffWindow>,
}

impl From<&Transmission> for TransmissionView {
    fn from(t: &Transmission) -> Self {
        Self {
            id: t.id,
            sender: t.sender,
            receiver: t.receiver,
            payload: t.payload.clone(),
            status: t.status(),
            attempts: t.attempts(),
            created_at: t.created_at.as_secs_f64(),
            resume_at: t.resume_at().map(|r| r.as_secs_f64()),
            backoff_times: t.first_collision(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StationView {
    pub id: StationId,
    pub queued: usize,
    pub current: Option<TransmissionId>,
    pub status: Option<TransmissionStatus>,
    pub backoff_counter: u32,
}

impl From<&Station> for StationView {
    fn from(s: &Station) -> Self {
        Self {
            id: s.id(),
            queued: s.queued(),
            current: s.current().map(|t| t.id),
            status: s.current().map(|t| t.status()),
            backoff_counter: s.backoff_counter(),
        }
    }
}

#[derive(Deserialize)]
struct Pagination {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn communicate(
    State(state): State<SharedState>,
    Json(req): Json<CommunicateRequest>,
) -> Result<Json<CommunicateResponse>, ApiError> {
    let (id, rx) = state.submit_and_watch(req.start, req.end, &req.msg).await?;
    info!("PC {} -> PC {}: transmission {} waiting for the bus", req.start, req.end, id);

    let outcome = match tokio::time::timeout(state.request_timeout, rx).await {
        Ok(Ok(t)) => t,
        Ok(Err(_)) => return Err(ApiError::Unavailable),
        Err(_) => return Err(ApiError::Timeout(id)),
    };
    let body = CommunicateResponse::from_outcome(&outcome);
    match outcome.status() {
        TransmissionStatus::Delivered => Ok(Json(body)),
        TransmissionStatus::Failed => Err(ApiError::Failed(Box::new(body))),
        _ => Err(ApiError::Cancelled(Box::new(body))),
    }
}

async fn submit(
    State(state): State<SharedState>,
    Json(req): Json<CommunicateRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let id = state.submit(req.start, req.end, &req.msg).await?;
    let response = SubmitResponse { id, status: TransmissionStatus::Pending };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn transmission(
    Path(id): Path<TransmissionId>,
    State(state): State<SharedState>,
) -> Result<Json<TransmissionView>, ApiError> {
    let scheduler = state.scheduler.lock().await;
    scheduler
        .transmission(id)
        .map(|t| Json(TransmissionView::from(t)))
        .ok_or(ApiError::NotFound(id))
}

async fn cancel(
    Path(id): Path<TransmissionId>,
    State(state): State<SharedState>,
) -> Result<Json<TransmissionView>, ApiError> {
    let t = state.cancel(id).await?;
    Ok(Json(TransmissionView::from(&t)))
}

async fn log_entries(Query(p): Query<Pagination>, State(state): State<SharedState>) -> Json<Vec<LogEntry>> {
    let limit = p.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let offset = p.offset.unwrap_or(0);
    let scheduler = state.scheduler.lock().await;
    Json(scheduler.log().page(offset, limit).to_vec())
}

async fn stations(State(state): State<SharedState>) -> Json<Vec<StationView>> {
    let scheduler = state.scheduler.lock().await;
    Json(scheduler.stations().iter().map(StationView::from).collect())
}

async fn stats(State(state): State<SharedState>) -> Json<BusStats> {
    let scheduler = state.scheduler.lock().await;
    Json(scheduler.stats().clone())
}

async fn index(State(state): State<SharedState>) -> Html<String> {
    let scheduler = state.scheduler.lock().await;
    let stats = scheduler.stats();
    let on_bus: Vec<_> = scheduler.medium().occupancy().collect();
    let stations: String = scheduler
        .stations()
        .iter()
        .map(|s| {
            let (class, label) = match s.current() {
                Some(t) => (t.status().to_string(), format!("#{} to PC {}", t.id, t.receiver)),
                None => ("idle".to_string(), "idle".to_string()),
            };
            format!(
                "<div class=\"pc {class}\"><b>PC {}</b><br>{label}<br>queued {} / backoffs {}</div>",
                s.id(),
                s.queued(),
                s.backoff_counter()
            )
        })
        .collect();
    let bus = if on_bus.is_empty() {
        "bus idle".to_string()
    } else {
        format!("on the wire: {:?}", on_bus)
    };
    let now = scheduler.now().as_secs_f64();
    let driver = if state.is_running() { "running" } else { "stopped" };
    Html(format!(
        r#"<!doctype html>
<html>
<head>
<title>EtherSim shared bus</title>
<style>
  body {{ font-family: sans-serif; margin: 2em; }}
  .stations {{ display: flex; gap: 1em; }}
  .pc {{ border: 2px solid #999; border-radius: 6px; padding: 0.5em 1em; }}
  .inflight {{ border-color: #2a7; }}
  .backoff, .collided {{ border-color: #d70; }}
  .bus {{ border-top: 6px solid #333; margin-top: 1em; padding-top: 0.5em; }}
</style>
</head>
<body>
<h1>EtherSim shared bus</h1>
<p>t = {now:.3}s, driver {driver}. {} delivered, {} collisions, {} failed, {} cancelled.</p>
<div class="stations">{stations}</div>
<div class="bus">{bus}</div>
<p>Live updates on <code>/ws</code>, history on <code>/api/log</code>.</p>
</body>
</html>"#,
        stats.delivered, stats.collisions, stats.failed, stats.cancelled
    ))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type UpdateSink = SplitSink<WebSocket, Message>;

async fn send_update(sink: &mut UpdateSink, update: &BusUpdate) -> Result<(), axum::Error> {
    match serde_json::to_string(update) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!("Dropping update that failed to serialize: {}", e);
            Ok(())
        }
    }
}

/// Replays the tail of the log, then streams live updates until the
/// client goes away.
async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sink, mut stream) = socket.split();

    // subscribing under the lock leaves no gap and no overlap with the backlog
    let (backlog, mut rx) = {
        let scheduler = state.scheduler.lock().await;
        let log = scheduler.log();
        let backlog = log.since(log.len().saturating_sub(WS_BACKLOG)).to_vec();
        (backlog, state.updates.subscribe())
    };
    for entry in backlog {
        if send_update(&mut sink, &BusUpdate::LogEntry(entry)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Ok(update) => {
                    if send_update(&mut sink, &update).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagging, skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

pub fn create_router(state: SharedState, allowed_origins: Vec<String>) -> Router {
    let origins = Arc::new(allowed_origins);
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| origins.iter().any(|prefix| o.starts_with(prefix.as_str())))
                .unwrap_or(false)
        }));
    Router::new()
        .route("/", get(index))
        .route("/api/communicate", post(communicate))
        .route("/api/transmissions", post(submit))
        .route("/api/transmissions/:id", get(transmission).delete(cancel))
        .route("/api/log", get(log_entries))
        .route("/api/stations", get(stations))
        .route("/api/stats", get(stats))
        .route("/ws", get(websocket_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(state: SharedState, addr: SocketAddr, allowed_origins: Vec<String>) -> std::io::Result<()> {
    let app = create_router(state, allowed_origins);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use ethersim_bus::{BusConfig, Scheduler};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn bus_config() -> BusConfig {
        BusConfig {
            slot_time: Duration::from_millis(10),
            collision_window: Duration::from_millis(10),
            propagation_delay: Duration::from_millis(30),
            seed: Some(11),
            ..Default::default()
        }
    }

    fn test_state() -> SharedState {
        SharedState::new(Scheduler::new(bus_config()).unwrap(), Duration::from_secs(30))
    }

    fn app(state: &SharedState) -> Router {
        create_router(state.clone(), vec!["http://localhost".to_string()])
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    /// Steps the bus in 10ms ticks until `done` reports the request finished.
    async fn drive_until<F: Fn() -> bool>(state: &SharedState, done: F) {
        let mut now = Duration::ZERO;
        while !done() {
            state.advance(now).await.unwrap();
            now += Duration::from_millis(10);
            assert!(now < Duration::from_secs(3600), "bus never settled");
            tokio::task::yield_now().await;
        }
    }

    async fn wait_submitted(state: &SharedState, count: u64) {
        while state.scheduler.lock().await.stats().submitted < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_communicate_on_idle_bus() {
        let state = test_state();
        let pending = tokio::spawn(call(
            app(&state),
            post_json("/api/communicate", json!({"start": 1, "end": 2, "msg": "hello"})),
        ));
        wait_submitted(&state, 1).await;
        drive_until(&state, || pending.is_finished()).await;

        let (status, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Packet from PC 1 successfully received by PC 2");
        assert!(body["backoffTimes"].is_null());
        assert_eq!(body["status"], "delivered");
        assert_eq!(body["attempts"], 1);
    }

    #[tokio::test]
    async fn test_communicate_reports_backoff_after_collision() {
        let state = test_state();
        let pending = tokio::spawn(call(
            app(&state),
            post_json("/api/communicate", json!({"start": 1, "end": 3, "msg": "first"})),
        ));
        wait_submitted(&state, 1).await;
        state.submit(2, 3, "second").await.unwrap();
        drive_until(&state, || pending.is_finished()).await;

        let (status, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let old = body["backoffTimes"]["oldMessage"].as_f64().unwrap();
        let new = body["backoffTimes"]["newMessage"].as_f64().unwrap();
        assert!(old > 0.0);
        assert!(new > 0.0);
        assert!(body["attempts"].as_u64().unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_communicate_reports_exhaustion() {
        let config = BusConfig { max_attempts: 1, ..bus_config() };
        let state = SharedState::new(Scheduler::new(config).unwrap(), Duration::from_secs(30));
        let pending = tokio::spawn(call(
            app(&state),
            post_json("/api/communicate", json!({"start": 1, "end": 3, "msg": "first"})),
        ));
        wait_submitted(&state, 1).await;
        state.submit(2, 3, "second").await.unwrap();
        drive_until(&state, || pending.is_finished()).await;

        let (status, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["attempts"], 1);
        assert_eq!(body["message"], "Transmission from PC 1 to PC 3 failed after 1 attempts");
        assert!(body["backoffTimes"]["oldMessage"].as_f64().unwrap() > 0.0);
        assert!(body["backoffTimes"]["newMessage"].as_f64().unwrap() > 0.0);
        assert_eq!(body["id"], 1);
        assert_eq!(state.scheduler.lock().await.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_communicate_times_out_when_bus_stalls() {
        let state = SharedState::new(Scheduler::new(bus_config()).unwrap(), Duration::from_millis(50));
        let (status, body) = call(
            app(&state),
            post_json("/api/communicate", json!({"start": 1, "end": 2, "msg": "anyone?"})),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["message"], "Timed out waiting for transmission 1");
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let state = test_state();

        let (status, body) = call(
            app(&state),
            post_json("/api/communicate", json!({"start": 1, "end": 2, "msg": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Message cannot be empty");

        let (status, _) = call(
            app(&state),
            post_json("/api/communicate", json!({"start": 2, "end": 2, "msg": "loop"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app(&state),
            post_json("/api/transmissions", json!({"start": 0, "end": 2, "msg": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let big = "x".repeat(1501);
        let (status, _) = call(
            app(&state),
            post_json("/api/transmissions", json!({"start": 1, "end": 2, "msg": big})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        assert!(state.scheduler.lock().await.log().is_empty());
    }

    #[tokio::test]
    async fn test_submit_then_cancel() {
        let state = test_state();
        let (status, body) = call(
            app(&state),
            post_json("/api/transmissions", json!({"start": 4, "end": 5, "msg": "later"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        let id = body["id"].as_u64().unwrap();

        let (status, body) = call(app(&state), request("GET", &format!("/api/transmissions/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"], "later");

        let (status, body) = call(app(&state), request("DELETE", &format!("/api/transmissions/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_in_flight_conflicts() {
        let state = test_state();
        let id = state.submit(1, 2, "on the wire").await.unwrap();
        state.advance(Duration::ZERO).await.unwrap();

        let (status, body) = call(app(&state), request("DELETE", &format!("/api/transmissions/{id}"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["message"].as_str().unwrap().contains("in flight"));
    }

    #[tokio::test]
    async fn test_unknown_transmission() {
        let state = test_state();
        let (status, _) = call(app(&state), request("GET", "/api/transmissions/42")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app(&state), request("DELETE", "/api/transmissions/42")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_read_endpoints() {
        let state = test_state();
        state.submit(1, 2, "a").await.unwrap();
        state.submit(3, 4, "b").await.unwrap();

        let (status, body) = call(app(&state), request("GET", "/api/stations")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 6);
        assert_eq!(body[0]["queued"], 1);

        let (_, body) = call(app(&state), request("GET", "/api/log?offset=1&limit=5")).await;
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["kind"], "enqueued");
        assert_eq!(entries[0]["sender"], 3);

        let (_, body) = call(app(&state), request("GET", "/api/stats")).await;
        assert_eq!(body["submitted"], 2);

        let response = app(&state).oneshot(request("GET", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8_lossy(&bytes);
        assert!(page.contains("EtherSim shared bus"));
        assert!(page.contains("PC 6"));
    }

    #[tokio::test]
    async fn test_stopped_simulation_is_unavailable() {
        let state = test_state();
        state.stop().await;
        let (status, body) = call(
            app(&state),
            post_json("/api/communicate", json!({"start": 1, "end": 2, "msg": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["message"], "Simulation is not running");
    }
}
