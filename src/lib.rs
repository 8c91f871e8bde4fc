pub mod capture;
pub mod error;
pub mod gallery;
pub mod motion;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod timelapse;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use capture::{Controls, Resolution, Transform};
pub use error::{CameraError, CameraResult};

/// Settings loaded once at startup and never re-read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub camera: CameraSettings,
    pub stream: StreamSettings,
    pub timelapse: TimelapseSettings,
    pub gallery: GallerySettings,
    pub server: ServerSettings,
    pub motion: MotionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CameraSettings {
    /// V4L2 device path, or "auto" for the first MJPEG capture device
    pub device: String,
    pub buffer_count: u32,
    /// Key into `available_resolutions`
    pub resolution: String,
    pub available_resolutions: BTreeMap<String, Resolution>,
    /// Index into the sensor modes the camera reports
    pub sensor_mode: usize,
    pub controls: Controls,
    pub rotation: Transform,
    pub capture_settings: CaptureSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Also write a lossless `.dng` next to each timelapse image
    #[serde(rename = "makeRaw", alias = "makeraw")]
    pub make_raw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamSettings {
    pub first_frame_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// How often an idle HTTP consumer checks whether its client is gone
    pub consumer_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimelapseSettings {
    pub interval_secs: f64,
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GallerySettings {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MotionSettings {
    pub enabled: bool,
    /// BCM number of the pin the PIR sensor drives
    pub gpio_pin: u8,
    pub poll_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        let available_resolutions = [
            ("low", Resolution::new(640, 480)),
            ("medium", Resolution::new(1280, 720)),
            ("high", Resolution::new(1920, 1080)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            device: "/dev/video0".into(),
            buffer_count: 4,
            resolution: "low".into(),
            available_resolutions,
            sensor_mode: 0,
            controls: Controls::new(),
            rotation: Transform::default(),
            capture_settings: CaptureSettings::default(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            first_frame_timeout_ms: 5000,
            stop_timeout_ms: 3000,
            consumer_poll_ms: 1000,
        }
    }
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            interval_secs: 2.0,
            stop_timeout_ms: 10_000,
        }
    }
}

impl Default for GallerySettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("static/gallery"),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
        }
    }
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            gpio_pin: 14,
            poll_ms: 100,
        }
    }
}

impl CameraSettings {
    /// Keys are matched case-insensitively; the `config` crate lowercases
    /// map keys but leaves string values alone.
    pub fn selected_resolution(&self) -> CameraResult<Resolution> {
        self.available_resolutions
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(&self.resolution))
            .map(|(_, resolution)| *resolution)
            .ok_or_else(|| {
                CameraError::configuration(format!(
                    "resolution {:?} is not one of the available resolutions {:?}",
                    self.resolution,
                    self.available_resolutions.keys().collect::<Vec<_>>()
                ))
            })
    }
}

impl StreamSettings {
    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn consumer_poll(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_ms)
    }
}

impl TimelapseSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl MotionSettings {
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl Settings {
    /// Load from an optional JSON/TOML file layered with `PILAPSE__*`
    /// environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> CameraResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(config::Environment::with_prefix("PILAPSE").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> CameraResult<()> {
        self.camera.selected_resolution()?;

        if self.camera.buffer_count == 0 {
            return Err(CameraError::configuration("camera buffer-count must be at least 1"));
        }
        if !(self.timelapse.interval_secs.is_finite() && self.timelapse.interval_secs > 0.0) {
            return Err(CameraError::configuration(format!(
                "timelapse interval-secs must be greater than zero, got {}",
                self.timelapse.interval_secs
            )));
        }
        let timeouts = [
            ("stream first-frame-timeout-ms", self.stream.first_frame_timeout_ms),
            ("stream stop-timeout-ms", self.stream.stop_timeout_ms),
            ("stream consumer-poll-ms", self.stream.consumer_poll_ms),
            ("timelapse stop-timeout-ms", self.timelapse.stop_timeout_ms),
            ("motion poll-ms", self.motion.poll_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(CameraError::configuration(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}
