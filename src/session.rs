//! Camera session: sole owner of the hardware handle
//!
//! Every operation that touches the camera takes the session's transition
//! lock, so stream start/stop, still captures and reconfiguration are
//! linearized. The current mode is also published through an [`ArcSwap`] so
//! readers never queue behind an in-flight capture.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::{
    CameraDevice, CaptureMetadata, Controls, DeviceConfig, Purpose, Resolution, SensorMode,
    Transform,
};
use crate::error::{CameraError, CameraResult};
use crate::pipeline::{FrameBuffer, Next, StreamBroadcaster};
use crate::{CameraSettings, StreamSettings};

/// Exclusive operating state of the camera hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Idle,
    Streaming,
    Capturing,
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CameraMode::Idle => "idle",
            CameraMode::Streaming => "streaming",
            CameraMode::Capturing => "capturing",
        })
    }
}

/// A single still capture: where to write it and whether to keep a raw
/// sidecar next to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub path: PathBuf,
    pub make_raw: bool,
}

impl CaptureRequest {
    pub fn new(path: impl Into<PathBuf>, make_raw: bool) -> Self {
        Self {
            path: path.into(),
            make_raw,
        }
    }

    /// Sibling `.dng` path when a raw sidecar is requested
    pub fn raw_path(&self) -> Option<PathBuf> {
        self.make_raw.then(|| self.path.with_extension("dng"))
    }
}

/// Settings that can only change while the stream is down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RestartSettings {
    pub hflip: Option<bool>,
    pub vflip: Option<bool>,
}

/// Snapshot of the session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub mode: CameraMode,
    pub still_resolution: Resolution,
    pub stream_resolution: Resolution,
    pub sensor_mode: Option<SensorMode>,
    pub sensor_modes: Vec<SensorMode>,
    pub transform: Transform,
    /// Why the last stream died, cleared by the next successful start
    pub last_stream_error: Option<String>,
}

struct Inner {
    device: Box<dyn CameraDevice>,
    mode: CameraMode,
    still_resolution: Resolution,
    stream_resolution: Resolution,
    sensor_mode: Option<SensorMode>,
    sensor_modes: Vec<SensorMode>,
    supported_controls: Vec<String>,
    transform: Transform,
    broadcaster: Option<StreamBroadcaster>,
    last_stream_error: Option<String>,
}

pub struct CameraSession {
    inner: Mutex<Inner>,
    frames: Arc<FrameBuffer>,
    status: ArcSwap<SessionStatus>,
    first_frame_timeout: Duration,
    stop_timeout: Duration,
    supports_raw: bool,
}

impl CameraSession {
    /// Take ownership of `device` and resolve the configured resolution,
    /// sensor mode and controls against what the hardware offers.
    pub fn new(
        mut device: Box<dyn CameraDevice>,
        camera: &CameraSettings,
        stream: &StreamSettings,
    ) -> CameraResult<Self> {
        let resolution = camera.selected_resolution()?;

        let sensor_modes = device.supported_modes()?;
        let sensor_mode = sensor_modes.get(camera.sensor_mode).cloned().ok_or_else(|| {
            CameraError::configuration(format!(
                "sensor-mode {} out of range, camera offers {} modes",
                camera.sensor_mode,
                sensor_modes.len()
            ))
        })?;

        let supports_raw = device.supports_raw();
        let supported_controls = device.supported_controls()?;
        let controls = filter_controls(&camera.controls, &supported_controls);
        device.set_controls(&controls)?;

        info!(
            "Camera session ready: {} via sensor mode {} ({})",
            resolution, camera.sensor_mode, sensor_mode.size
        );

        let inner = Inner {
            device,
            mode: CameraMode::Idle,
            still_resolution: resolution,
            stream_resolution: resolution,
            sensor_mode: Some(sensor_mode),
            sensor_modes,
            supported_controls,
            transform: camera.rotation,
            broadcaster: None,
            last_stream_error: None,
        };
        let status = ArcSwap::from_pointee(inner.status());

        Ok(Self {
            inner: Mutex::new(inner),
            frames: Arc::new(FrameBuffer::new()),
            status,
            first_frame_timeout: stream.first_frame_timeout(),
            stop_timeout: stream.stop_timeout(),
            supports_raw,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, inner: &mut Inner, mode: CameraMode) {
        if inner.mode != mode {
            debug!("Camera mode {} -> {}", inner.mode, mode);
        }
        inner.mode = mode;
        self.publish_status(inner);
    }

    fn publish_status(&self, inner: &Inner) {
        self.status.store(Arc::new(inner.status()));
    }

    /// Frame buffer fed while streaming
    pub fn frames(&self) -> Arc<FrameBuffer> {
        self.frames.clone()
    }

    pub fn mode(&self) -> CameraMode {
        self.status.load().mode
    }

    pub fn status(&self) -> Arc<SessionStatus> {
        self.status.load_full()
    }

    /// Whether raw sidecars can be honoured. Turns a request for them into
    /// a single startup warning on hardware that has none, instead of a
    /// failed capture every time.
    pub fn raw_sidecars(&self, requested: bool) -> bool {
        if requested && !self.supports_raw {
            warn!("Camera cannot produce raw sidecars, makeRaw ignored");
            return false;
        }
        requested
    }

    pub fn supported_modes(&self) -> Vec<SensorMode> {
        self.status.load().sensor_modes.clone()
    }

    pub fn configure_still(&self, resolution: Resolution) -> CameraResult<()> {
        let mut inner = self.lock();
        self.reap_logged(&mut inner);
        require_idle(&inner, "configure stills")?;
        inner.still_resolution = resolution;
        self.publish_status(&inner);
        Ok(())
    }

    pub fn configure_stream(
        &self,
        resolution: Resolution,
        sensor_mode: Option<SensorMode>,
    ) -> CameraResult<()> {
        let mut inner = self.lock();
        self.reap_logged(&mut inner);
        require_idle(&inner, "configure the stream")?;
        inner.stream_resolution = resolution;
        inner.sensor_mode = sensor_mode;
        self.publish_status(&inner);
        Ok(())
    }

    /// Idle -> Streaming. Returns once the first frame is published.
    ///
    /// A no-op while already streaming. A stream that died on a hardware
    /// error is cleaned up and started afresh.
    #[instrument(skip(self))]
    pub fn start_stream(&self) -> CameraResult<()> {
        let mut inner = self.lock();
        if let Some(e) = self.reap(&mut inner) {
            warn!("Restarting stream after failure: {}", e);
        }
        match inner.mode {
            CameraMode::Streaming => {
                debug!("Stream already running");
                Ok(())
            }
            _ => self.start_locked(&mut inner),
        }
    }

    /// Streaming -> Idle. No frame is published once this returns.
    ///
    /// A no-op while idle. If the stream had already died on a hardware
    /// error, that error is returned here.
    #[instrument(skip(self))]
    pub fn stop_stream(&self) -> CameraResult<()> {
        let mut inner = self.lock();
        if let Some(e) = self.reap(&mut inner) {
            return Err(e);
        }
        match inner.mode {
            CameraMode::Streaming => self.stop_locked(&mut inner),
            _ => {
                debug!("Stream not running");
                Ok(())
            }
        }
    }

    /// Idle -> Capturing -> Idle. Refused while streaming; the caller has to
    /// stop the stream first.
    #[instrument(skip(self), fields(path = %request.path.display()))]
    pub fn capture_still(&self, request: &CaptureRequest) -> CameraResult<CaptureMetadata> {
        let mut inner = self.lock();
        self.reap_logged(&mut inner);
        require_idle(&inner, "capture a still")?;

        self.set_mode(&mut inner, CameraMode::Capturing);
        let result = capture_locked(&mut inner, request);
        self.set_mode(&mut inner, CameraMode::Idle);

        match &result {
            Ok(_) => metrics::counter!("pilapse_stills_captured").increment(1),
            Err(_) => metrics::counter!("pilapse_still_failures").increment(1),
        }
        result
    }

    /// Apply orientation changes: stop the stream, mutate the
    /// configuration, restart it if it was running.
    pub fn apply_restart_settings(&self, settings: RestartSettings) -> CameraResult<()> {
        let mut inner = self.lock();
        self.reap_logged(&mut inner);

        let was_streaming = inner.mode == CameraMode::Streaming;
        if was_streaming {
            self.stop_locked(&mut inner)?;
        }

        if let Some(hflip) = settings.hflip {
            inner.transform.hflip = hflip;
        }
        if let Some(vflip) = settings.vflip {
            inner.transform.vflip = vflip;
        }
        info!("Transform now {:?}", inner.transform);
        self.publish_status(&inner);

        if was_streaming {
            self.start_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Set tuning controls that don't need a restart. Names the camera
    /// doesn't support are skipped; the applied names are returned.
    pub fn apply_controls(&self, controls: &Controls) -> CameraResult<Vec<String>> {
        let mut inner = self.lock();
        let supported = filter_controls(controls, &inner.supported_controls);
        inner.device.set_controls(&supported)?;
        Ok(supported.into_keys().collect())
    }

    fn start_locked(&self, inner: &mut Inner) -> CameraResult<()> {
        let config = DeviceConfig {
            purpose: Purpose::Stream,
            resolution: inner.stream_resolution,
            sensor_mode: inner.sensor_mode.clone(),
            transform: inner.transform,
        };
        inner.device.configure(&config)?;
        let source = inner.device.start_stream()?;

        self.frames.open();
        let mut cursor = self.frames.cursor();
        let broadcaster = match StreamBroadcaster::spawn(source, self.frames.clone()) {
            Ok(b) => b,
            Err(e) => {
                self.frames.close();
                return Err(e);
            }
        };

        match self.frames.wait_for_next(&mut cursor, self.first_frame_timeout) {
            Next::Frame(frame) => {
                info!(
                    "Stream started at {} (first frame {} bytes)",
                    inner.stream_resolution,
                    frame.len()
                );
                inner.broadcaster = Some(broadcaster);
                inner.last_stream_error = None;
                self.set_mode(inner, CameraMode::Streaming);
                Ok(())
            }
            Next::Ended => {
                let report = broadcaster.join()?;
                Err(report
                    .error
                    .unwrap_or_else(|| CameraError::hardware("stream ended before its first frame")))
            }
            Next::TimedOut => {
                if let Err(e) = broadcaster.stop(self.stop_timeout) {
                    warn!("{}", e);
                }
                self.frames.close();
                Err(CameraError::hardware(format!(
                    "no frame within {:?} of starting the stream",
                    self.first_frame_timeout
                )))
            }
        }
    }

    fn stop_locked(&self, inner: &mut Inner) -> CameraResult<()> {
        let stopped = match inner.broadcaster.take() {
            Some(broadcaster) => {
                broadcaster
                    .stop(self.stop_timeout)
                    .and_then(|report| match report.error {
                        Some(e) => {
                            inner.last_stream_error = Some(e.to_string());
                            Err(e)
                        }
                        None => {
                            info!("Stream stopped after {} frames", report.frames);
                            Ok(())
                        }
                    })
            }
            None => Ok(()),
        };
        self.frames.close();
        self.set_mode(inner, CameraMode::Idle);
        stopped
    }

    /// Clean up a broadcaster that exited on its own. Returns the error it
    /// died with.
    fn reap(&self, inner: &mut Inner) -> Option<CameraError> {
        // The broadcaster closes the buffer on its way out, so a closed
        // buffer while streaming means the loop is gone or about to be.
        let dead = !self.frames.is_live()
            || inner.broadcaster.as_ref().map_or(true, |b| b.is_finished());
        if inner.mode != CameraMode::Streaming || !dead {
            return None;
        }
        let error = match inner.broadcaster.take().map(StreamBroadcaster::join) {
            Some(Ok(report)) => report.error,
            Some(Err(e)) => Some(e),
            None => None,
        }
        .unwrap_or_else(|| CameraError::hardware("stream broadcaster exited unexpectedly"));

        self.frames.close();
        inner.last_stream_error = Some(error.to_string());
        self.set_mode(inner, CameraMode::Idle);
        Some(error)
    }

    fn reap_logged(&self, inner: &mut Inner) {
        if let Some(e) = self.reap(inner) {
            warn!("Stream had stopped: {}", e);
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        let mut inner = self.lock();
        if inner.mode == CameraMode::Streaming {
            if let Err(e) = self.stop_locked(&mut inner) {
                warn!("Stopping stream on shutdown: {}", e);
            }
        }
    }
}

impl Inner {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            mode: self.mode,
            still_resolution: self.still_resolution,
            stream_resolution: self.stream_resolution,
            sensor_mode: self.sensor_mode.clone(),
            sensor_modes: self.sensor_modes.clone(),
            transform: self.transform,
            last_stream_error: self.last_stream_error.clone(),
        }
    }
}

fn require_idle(inner: &Inner, operation: &'static str) -> CameraResult<()> {
    match inner.mode {
        CameraMode::Idle => Ok(()),
        mode => Err(CameraError::InvalidState { operation, mode }),
    }
}

/// The capture request is dropped, releasing the hardware, on every path
/// out of here, including a failed raw save after the JPEG was written.
fn capture_locked(inner: &mut Inner, request: &CaptureRequest) -> CameraResult<CaptureMetadata> {
    let config = DeviceConfig {
        purpose: Purpose::Still,
        resolution: inner.still_resolution,
        sensor_mode: None,
        transform: inner.transform,
    };
    inner.device.configure(&config)?;

    if let Some(parent) = request.path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut still = inner.device.capture_request()?;
    let metadata = still.save_jpeg(&request.path)?;
    if let Some(raw) = request.raw_path() {
        still.save_raw(&raw)?;
    }
    info!("Image captured successfully. Path: {}", request.path.display());
    Ok(metadata)
}

/// Keep the controls the camera knows, under the camera's own spelling
fn filter_controls(controls: &Controls, supported: &[String]) -> Controls {
    controls
        .iter()
        .filter_map(|(name, value)| {
            match supported.iter().find(|s| s.eq_ignore_ascii_case(name)) {
                Some(canonical) => Some((canonical.clone(), *value)),
                None => {
                    warn!("Camera has no control named {}, ignoring", name);
                    None
                }
            }
        })
        .collect()
}
