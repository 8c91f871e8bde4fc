//! HTTP surface: control endpoints, the MJPEG feed and the gallery
//!
//! Camera calls block on hardware, so every handler that reaches the session
//! hops onto the blocking pool. Each MJPEG client gets its own blocking
//! worker running [`pump_frames`] against the shared frame buffer.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use flume::SendTimeoutError;
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::capture::{Controls, Frame};
use crate::error::{CameraError, CameraResult};
use crate::gallery::Gallery;
use crate::pipeline::{Cursor, FrameBuffer, Next};
use crate::session::{CameraSession, RestartSettings, SessionStatus};
use crate::timelapse::{StreamStart, TimelapseController, TimelapseStatus};

const BOUNDARY: &str = "frame";

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<CameraSession>,
    pub timelapse: Arc<TimelapseController>,
    pub gallery: Arc<Gallery>,
    /// Timelapse interval used when a start request names none
    pub interval: Duration,
    pub consumer_poll: Duration,
}

/// Body of every control endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }

    fn failure(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: message.into(),
        })
    }
}

/// Errors a control endpoint can answer with
#[derive(Debug)]
pub enum ApiError {
    Camera(CameraError),
    /// Refused because of another activity, not the camera mode
    Busy(&'static str),
    ServiceUnavailable(&'static str),
}

impl From<CameraError> for ApiError {
    fn from(e: CameraError) -> Self {
        ApiError::Camera(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Camera(e) => {
                let status = match e {
                    CameraError::InvalidState { .. } => StatusCode::CONFLICT,
                    CameraError::Hardware(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    CameraError::Configuration(_) => StatusCode::BAD_REQUEST,
                };
                (status, e.to_string())
            }
            ApiError::Busy(message) => (StatusCode::CONFLICT, message.to_string()),
            ApiError::ServiceUnavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, message.to_string())
            }
        };
        warn!("Request failed ({}): {}", status, message);
        (status, ControlResponse::failure(message)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let gallery_dir = state.gallery.root().to_path_buf();
    Router::new()
        .route("/stream.mjpg", get(stream_mjpg))
        .route("/api/status", get(status))
        .route("/api/stream/start", post(start_stream))
        .route("/api/stream/stop", post(stop_stream))
        .route("/api/timelapse/start", post(start_timelapse))
        .route("/api/timelapse/stop", post(stop_timelapse))
        .route("/api/snapshot", post(snapshot))
        .route("/api/camera/restart", post(restart_camera))
        .route("/api/camera/controls", post(set_controls))
        .route("/api/gallery", get(list_gallery))
        .nest_service("/gallery", ServeDir::new(gallery_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve(
    state: AppState,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Serving on http://{}", listener.local_addr()?);
    info!("Live feed at http://{}/stream.mjpg", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> CameraResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(CameraError::hardware(format!("camera worker failed: {e}")).into()),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    camera: SessionStatus,
    stream_live: bool,
    frame_sequence: u64,
    timelapse: TimelapseStatus,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let frames = state.session.frames();
    Json(StatusResponse {
        camera: SessionStatus::clone(&state.session.status()),
        stream_live: frames.is_live(),
        frame_sequence: frames.sequence(),
        timelapse: state.timelapse.status(),
    })
}

async fn start_stream(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    let timelapse = state.timelapse.clone();
    match blocking(move || timelapse.start_stream()).await? {
        StreamStart::Started => Ok(ControlResponse::ok("Stream started")),
        StreamStart::TimelapseRunning => Err(ApiError::Busy(
            "Cannot start the stream while a timelapse is running",
        )),
    }
}

async fn stop_stream(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    let session = state.session.clone();
    blocking(move || session.stop_stream()).await?;
    Ok(ControlResponse::ok("Stream stopped"))
}

#[derive(Debug, Default, Deserialize)]
struct TimelapseRequest {
    interval_secs: Option<f64>,
}

async fn start_timelapse(
    State(state): State<AppState>,
    body: Option<Json<TimelapseRequest>>,
) -> ApiResult<Json<ControlResponse>> {
    let interval = match body.and_then(|Json(req)| req.interval_secs) {
        Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        Some(secs) => {
            return Err(CameraError::configuration(format!(
                "timelapse interval must be greater than zero, got {secs}"
            ))
            .into())
        }
        None => state.interval,
    };
    let timelapse = state.timelapse.clone();
    let outcome = blocking(move || timelapse.start(interval)).await?;
    Ok(ControlResponse::ok(outcome.message()))
}

async fn stop_timelapse(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    let timelapse = state.timelapse.clone();
    let outcome = blocking(move || timelapse.stop()).await?;
    Ok(ControlResponse::ok(outcome.message()))
}

async fn snapshot(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    let session = state.session.clone();
    let request = state.gallery.snapshot();
    let meta = blocking(move || session.capture_still(&request)).await?;
    Ok(ControlResponse::ok(format!(
        "Image captured successfully. Path: {}",
        meta.path.display()
    )))
}

async fn restart_camera(
    State(state): State<AppState>,
    Json(settings): Json<RestartSettings>,
) -> ApiResult<Json<ControlResponse>> {
    let session = state.session.clone();
    blocking(move || session.apply_restart_settings(settings)).await?;
    Ok(ControlResponse::ok("Camera restarted"))
}

async fn set_controls(
    State(state): State<AppState>,
    Json(controls): Json<Controls>,
) -> ApiResult<Json<ControlResponse>> {
    let session = state.session.clone();
    let applied = blocking(move || session.apply_controls(&controls)).await?;
    Ok(ControlResponse::ok(format!("Applied controls: {}", applied.join(", "))))
}

async fn list_gallery(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    let gallery = state.gallery.clone();
    Ok(Json(blocking(move || gallery.list()).await?))
}

async fn stream_mjpg(State(state): State<AppState>) -> Response {
    let frames = state.session.frames();
    if !frames.is_live() {
        return ApiError::ServiceUnavailable("Stream is not running").into_response();
    }

    let cursor = frames.cursor();
    let poll = state.consumer_poll;
    let (tx, rx) = flume::bounded::<Result<Bytes, Infallible>>(1);
    tokio::task::spawn_blocking(move || {
        let exit = pump_frames(&frames, cursor, poll, &tx);
        debug!(?exit, "MJPEG client finished");
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
        ],
        Body::from_stream(rx.into_stream()),
    )
        .into_response()
}

/// One part of the multipart feed
pub fn multipart_chunk(frame: &Frame) -> Bytes {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut chunk = BytesMut::with_capacity(header.len() + frame.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(&frame.data);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Why an MJPEG consumer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    StreamEnded,
    ClientGone,
}

/// Forward every new frame to one client until the stream ends or the
/// client goes away.
///
/// The buffer lock is only held inside `wait_for_next`; the chunk is handed
/// off afterwards. A frame the client is too slow to take within `poll` is
/// dropped, the next wait picks up the latest one.
pub fn pump_frames(
    frames: &FrameBuffer,
    mut cursor: Cursor,
    poll: Duration,
    tx: &flume::Sender<Result<Bytes, Infallible>>,
) -> ConsumerExit {
    loop {
        match frames.wait_for_next(&mut cursor, poll) {
            Next::Frame(frame) => match tx.send_timeout(Ok(multipart_chunk(&frame)), poll) {
                Ok(()) => {}
                Err(SendTimeoutError::Disconnected(_)) => return ConsumerExit::ClientGone,
                Err(SendTimeoutError::Timeout(_)) => {
                    debug!("Slow client, dropped frame {}", frame.sequence);
                }
            },
            Next::TimedOut if tx.is_disconnected() => return ConsumerExit::ClientGone,
            Next::TimedOut => {}
            Next::Ended => return ConsumerExit::StreamEnded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FakeCamera, Resolution};
    use crate::session::CameraMode;
    use crate::Settings;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Rig {
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let mut settings = Settings::default();
        settings
            .camera
            .available_resolutions
            .insert("tiny".into(), Resolution::new(32, 24));
        settings.camera.resolution = "tiny".into();

        let camera = FakeCamera::new().with_frame_interval(Duration::from_millis(5));
        let session = Arc::new(
            CameraSession::new(Box::new(camera), &settings.camera, &settings.stream).unwrap(),
        );
        let dir = tempfile::tempdir().unwrap();
        let gallery = Arc::new(Gallery::create(dir.path()).unwrap());
        let timelapse = Arc::new(TimelapseController::new(
            session.clone(),
            gallery.clone(),
            false,
            Duration::from_secs(5),
        ));
        Rig {
            state: AppState {
                session,
                timelapse,
                gallery,
                interval: Duration::from_millis(200),
                consumer_poll: Duration::from_millis(50),
            },
            _dir: dir,
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, json: Option<&str>) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match json {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        router(state.clone())
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn control(response: Response) -> ControlResponse {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_multipart_chunk_layout() {
        let chunk = multipart_chunk(&Frame::new(Bytes::from_static(b"JPEG"), 1));
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
    }

    #[test]
    fn test_pump_exits_when_client_is_gone() {
        let frames = FrameBuffer::new();
        frames.open();
        let cursor = frames.cursor();
        let (tx, rx) = flume::bounded(1);
        drop(rx);
        let exit = pump_frames(&frames, cursor, Duration::from_millis(10), &tx);
        assert_eq!(exit, ConsumerExit::ClientGone);
    }

    #[test]
    fn test_pump_exits_when_stream_ends() {
        let frames = Arc::new(FrameBuffer::new());
        frames.open();
        let cursor = frames.cursor();
        let (tx, rx) = flume::bounded(4);

        let pump = {
            let frames = frames.clone();
            std::thread::spawn(move || pump_frames(&frames, cursor, Duration::from_millis(10), &tx))
        };
        frames.publish(Frame::new(Bytes::from_static(b"a"), 1));
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        frames.close();
        assert_eq!(pump.join().unwrap(), ConsumerExit::StreamEnded);
    }

    #[tokio::test]
    async fn test_status_reports_idle_camera() {
        let rig = rig();
        let response = call(&rig.state, "GET", "/api/status", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["camera"]["mode"], "idle");
        assert_eq!(json["stream_live"], false);
        assert_eq!(json["timelapse"]["running"], false);
        assert_eq!(json["camera"]["sensor_modes"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_writes_fixed_path() {
        let rig = rig();
        let response = call(&rig.state, "POST", "/api/snapshot", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(control(response).await.success);
        assert!(rig.state.gallery.root().join("snapshot/pimage_snapshot.jpg").exists());
    }

    #[tokio::test]
    async fn test_snapshot_while_streaming_is_conflict() {
        let rig = rig();
        let response = call(&rig.state, "POST", "/api/stream/start", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = call(&rig.state, "POST", "/api/snapshot", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = control(response).await;
        assert!(!body.success);
        assert!(body.message.contains("streaming"));

        let response = call(&rig.state, "POST", "/api/stream/stop", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rig.state.session.mode(), CameraMode::Idle);
    }

    #[tokio::test]
    async fn test_timelapse_start_twice_and_blocks_stream() {
        let rig = rig();
        let first = control(call(&rig.state, "POST", "/api/timelapse/start", None).await).await;
        assert!(first.success);
        assert_eq!(first.message, "Timelapse started successfully");

        let second = control(call(&rig.state, "POST", "/api/timelapse/start", None).await).await;
        assert!(second.success);
        assert_eq!(second.message, "Timelapse is already running");

        let response = call(&rig.state, "POST", "/api/stream/start", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let stop = control(call(&rig.state, "POST", "/api/timelapse/stop", None).await).await;
        assert!(stop.success);
        assert!(!rig.state.timelapse.is_running());
    }

    #[tokio::test]
    async fn test_timelapse_rejects_bad_interval() {
        let rig = rig();
        let response = call(
            &rig.state,
            "POST",
            "/api/timelapse/start",
            Some(r#"{"interval_secs": 0}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!rig.state.timelapse.is_running());
    }

    #[tokio::test]
    async fn test_controls_and_restart() {
        let rig = rig();
        let response = call(
            &rig.state,
            "POST",
            "/api/camera/controls",
            Some(r#"{"Brightness": 0.5, "NoSuchControl": 1}"#),
        )
        .await;
        let body = control(response).await;
        assert!(body.success);
        assert_eq!(body.message, "Applied controls: Brightness");

        let response = call(&rig.state, "POST", "/api/camera/restart", Some(r#"{"hflip": true}"#)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rig.state.session.status().transform.hflip);
    }

    #[tokio::test]
    async fn test_mjpeg_unavailable_when_not_streaming() {
        let rig = rig();
        let response = call(&rig.state, "GET", "/stream.mjpg", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_mjpeg_feed_ends_with_stream() {
        let rig = rig();
        rig.state.session.start_stream().unwrap();

        let response = call(&rig.state, "GET", "/stream.mjpg", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut body = response.into_body();
        let chunk = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(chunk.ends_with(b"\r\n"));

        let session = rig.state.session.clone();
        tokio::task::spawn_blocking(move || session.stop_stream())
            .await
            .unwrap()
            .unwrap();
        while let Some(frame) = body.frame().await {
            frame.unwrap();
        }
    }

    #[tokio::test]
    async fn test_gallery_listing_and_files() {
        let rig = rig();
        std::fs::write(rig.state.gallery.root().join("pimage_7.jpg"), b"jpeg").unwrap();

        let response = call(&rig.state, "GET", "/api/gallery", None).await;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let names: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(names, vec!["pimage_7.jpg"]);

        let response = call(&rig.state, "GET", "/gallery/pimage_7.jpg", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"jpeg");
    }
}
