//! Hardware camera collaborator
//!
//! The session talks to the camera exclusively through [`CameraDevice`].
//! Starting a stream hands out a [`FrameSource`] (the encode pipeline), which
//! is the only piece that leaves the session and runs on the broadcaster
//! thread. Still captures go through a [`StillRequest`] that holds the
//! hardware buffers until it is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CameraResult;

/// Output size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(u32, u32)", into = "(u32, u32)")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(r: Resolution) -> Self {
        (r.width, r.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A readout mode offered by the sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorMode {
    pub size: Resolution,
    pub format: String,
    pub bit_depth: Option<u8>,
}

/// Orientation flips; changing them requires a stream restart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub hflip: bool,
    pub vflip: bool,
}

/// What the hardware is being configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Still,
    Stream,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub purpose: Purpose,
    pub resolution: Resolution,
    pub sensor_mode: Option<SensorMode>,
    pub transform: Transform,
}

/// Value of a tuning control such as brightness or exposure time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

pub type Controls = BTreeMap<String, ControlValue>;

/// What a still capture wrote to disk
#[derive(Debug, Clone, Serialize)]
pub struct CaptureMetadata {
    pub path: PathBuf,
    pub size: Resolution,
    pub bytes: usize,
    pub captured_at: DateTime<Utc>,
}

pub trait CameraDevice: Send {
    /// Sensor modes the hardware offers, in driver order
    fn supported_modes(&self) -> CameraResult<Vec<SensorMode>>;

    /// Names of the tuning controls the hardware accepts
    fn supported_controls(&self) -> CameraResult<Vec<String>>;

    fn configure(&mut self, config: &DeviceConfig) -> CameraResult<()>;

    fn set_controls(&mut self, controls: &Controls) -> CameraResult<()>;

    /// Start the encode pipeline for the currently configured stream
    fn start_stream(&mut self) -> CameraResult<Box<dyn FrameSource>>;

    /// Acquire the hardware for one still capture
    fn capture_request(&mut self) -> CameraResult<Box<dyn StillRequest + '_>>;

    /// Whether [`StillRequest::save_raw`] can succeed on this hardware
    fn supports_raw(&self) -> bool {
        true
    }
}

/// Running encode pipeline. Dropping it stops the hardware stream.
pub trait FrameSource: Send {
    /// Blocks until the next JPEG frame is available
    fn capture_frame(&mut self) -> CameraResult<Bytes>;
}

/// One captured still, released back to the hardware on drop
pub trait StillRequest {
    fn save_jpeg(&mut self, path: &Path) -> CameraResult<CaptureMetadata>;

    /// Lossless sidecar of the same exposure
    fn save_raw(&mut self, path: &Path) -> CameraResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_deserializes_from_pair() {
        let r: Resolution = serde_json::from_str("[1920, 1080]").unwrap();
        assert_eq!(r, Resolution::new(1920, 1080));
        assert_eq!(r.to_string(), "1920x1080");
    }

    #[test]
    fn test_control_value_untagged() {
        let controls: Controls =
            serde_json::from_str(r#"{"AeEnable": true, "ExposureTime": 20000, "Brightness": 0.25}"#)
                .unwrap();
        assert_eq!(controls["AeEnable"], ControlValue::Bool(true));
        assert_eq!(controls["ExposureTime"], ControlValue::Int(20000));
        assert_eq!(controls["Brightness"], ControlValue::Float(0.25));
    }
}
