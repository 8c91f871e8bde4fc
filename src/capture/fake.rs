//! Synthetic camera that produces real JPEG frames
//!
//! Used by the test suite and by `--fake` to run the server without
//! hardware. Failures can be injected per call, and a shared [`CallCounts`]
//! counts every hardware interaction so tests can assert on them.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::capture::device::{
    CameraDevice, CaptureMetadata, Controls, DeviceConfig, FrameSource, Resolution, SensorMode,
    StillRequest,
};
use crate::error::{CameraError, CameraResult};

const JPEG_QUALITY: u8 = 75;

/// Counters for every hardware interaction of a [`FakeCamera`]
#[derive(Debug, Default)]
pub struct CallCounts {
    pub configures: AtomicU64,
    pub streams_started: AtomicU64,
    pub streams_stopped: AtomicU64,
    /// Calls to `capture_frame`, failed ones included
    pub frame_calls: AtomicU64,
    pub stills: AtomicU64,
    pub raw_saves: AtomicU64,
    pub releases: AtomicU64,
    pub control_writes: AtomicU64,
}

impl CallCounts {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeCamera {
    modes: Vec<SensorMode>,
    controls: Vec<String>,
    resolution: Resolution,
    frame_interval: Duration,
    still_delay: Duration,
    fail_frame_call: Option<u64>,
    fail_stills: bool,
    fail_raw: bool,
    raw_supported: bool,
    calls: Arc<CallCounts>,
}

impl Default for FakeCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCamera {
    pub fn new() -> Self {
        let mode = |w, h| SensorMode {
            size: Resolution::new(w, h),
            format: "SRGGB10".into(),
            bit_depth: Some(10),
        };
        Self {
            modes: vec![mode(640, 480), mode(1296, 972), mode(1920, 1080)],
            controls: ["Brightness", "Contrast", "Saturation", "Sharpness", "ExposureTime", "AnalogueGain"]
                .into_iter()
                .map(String::from)
                .collect(),
            resolution: Resolution::new(64, 48),
            frame_interval: Duration::from_millis(20),
            still_delay: Duration::ZERO,
            fail_frame_call: None,
            fail_stills: false,
            fail_raw: false,
            raw_supported: true,
            calls: Arc::new(CallCounts::default()),
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Time a still capture takes
    pub fn with_still_delay(mut self, delay: Duration) -> Self {
        self.still_delay = delay;
        self
    }

    /// Fail the n-th `capture_frame` call (1-based, counted across streams)
    pub fn failing_frame_call(mut self, n: u64) -> Self {
        self.fail_frame_call = Some(n);
        self
    }

    pub fn failing_stills(mut self) -> Self {
        self.fail_stills = true;
        self
    }

    pub fn failing_raw(mut self) -> Self {
        self.fail_raw = true;
        self
    }

    /// Report no raw support, like an MJPEG-only device
    pub fn without_raw(mut self) -> Self {
        self.raw_supported = false;
        self
    }

    pub fn calls(&self) -> Arc<CallCounts> {
        self.calls.clone()
    }
}

impl CameraDevice for FakeCamera {
    fn supported_modes(&self) -> CameraResult<Vec<SensorMode>> {
        Ok(self.modes.clone())
    }

    fn supported_controls(&self) -> CameraResult<Vec<String>> {
        Ok(self.controls.clone())
    }

    fn configure(&mut self, config: &DeviceConfig) -> CameraResult<()> {
        self.calls.configures.fetch_add(1, Ordering::SeqCst);
        self.resolution = config.resolution;
        Ok(())
    }

    fn set_controls(&mut self, controls: &Controls) -> CameraResult<()> {
        self.calls
            .control_writes
            .fetch_add(controls.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn start_stream(&mut self) -> CameraResult<Box<dyn FrameSource>> {
        self.calls.streams_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            resolution: self.resolution,
            interval: self.frame_interval,
            fail_call: self.fail_frame_call,
            calls: self.calls.clone(),
        }))
    }

    fn capture_request(&mut self) -> CameraResult<Box<dyn StillRequest + '_>> {
        if self.fail_stills {
            return Err(CameraError::hardware("fake sensor refused still capture"));
        }
        std::thread::sleep(self.still_delay);
        let n = self.calls.stills.fetch_add(1, Ordering::SeqCst) + 1;
        let image = test_card(self.resolution, n);
        Ok(Box::new(FakeStill {
            jpeg: encode_jpeg(&image)?,
            raw: Bytes::from(image.into_raw()),
            size: self.resolution,
            fail_raw: self.fail_raw,
            calls: self.calls.clone(),
        }))
    }

    fn supports_raw(&self) -> bool {
        self.raw_supported
    }
}

struct FakeStream {
    resolution: Resolution,
    interval: Duration,
    fail_call: Option<u64>,
    calls: Arc<CallCounts>,
}

impl FrameSource for FakeStream {
    fn capture_frame(&mut self) -> CameraResult<Bytes> {
        std::thread::sleep(self.interval);
        let n = self.calls.frame_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_call == Some(n) {
            return Err(CameraError::hardware(format!("fake encoder failed on frame call {n}")));
        }
        encode_jpeg(&test_card(self.resolution, n))
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.calls.streams_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeStill {
    jpeg: Bytes,
    raw: Bytes,
    size: Resolution,
    fail_raw: bool,
    calls: Arc<CallCounts>,
}

impl StillRequest for FakeStill {
    fn save_jpeg(&mut self, path: &Path) -> CameraResult<CaptureMetadata> {
        std::fs::write(path, &self.jpeg)?;
        Ok(CaptureMetadata {
            path: path.to_path_buf(),
            size: self.size,
            bytes: self.jpeg.len(),
            captured_at: Utc::now(),
        })
    }

    fn save_raw(&mut self, path: &Path) -> CameraResult<()> {
        self.calls.raw_saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_raw {
            return Err(CameraError::hardware("fake sensor lost raw buffer"));
        }
        std::fs::write(path, &self.raw)?;
        Ok(())
    }
}

impl Drop for FakeStill {
    fn drop(&mut self) {
        self.calls.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Moving gradient so consecutive frames differ
fn test_card(size: Resolution, n: u64) -> RgbImage {
    let shift = (n % 256) as u32;
    RgbImage::from_fn(size.width.max(1), size.height.max(1), |x, y| {
        Rgb([
            ((x + shift) % 256) as u8,
            ((y + shift) % 256) as u8,
            (n.wrapping_mul(7) % 256) as u8,
        ])
    })
}

fn encode_jpeg(image: &RgbImage) -> CameraResult<Bytes> {
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder.encode_image(image)?;
    Ok(Bytes::from(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::{Purpose, Transform};

    fn stream_config(resolution: Resolution) -> DeviceConfig {
        DeviceConfig {
            purpose: Purpose::Stream,
            resolution,
            sensor_mode: None,
            transform: Transform::default(),
        }
    }

    #[test]
    fn test_frames_are_jpeg() {
        let mut camera = FakeCamera::new().with_frame_interval(Duration::ZERO);
        camera.configure(&stream_config(Resolution::new(32, 24))).unwrap();
        let mut source = camera.start_stream().unwrap();
        let frame = source.capture_frame().unwrap();
        assert_eq!(&frame[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_injected_frame_failure() {
        let mut camera = FakeCamera::new()
            .with_frame_interval(Duration::ZERO)
            .failing_frame_call(2);
        let mut source = camera.start_stream().unwrap();
        assert!(source.capture_frame().is_ok());
        assert!(matches!(source.capture_frame(), Err(CameraError::Hardware(_))));
        assert!(source.capture_frame().is_ok());
    }

    #[test]
    fn test_still_request_released_on_drop() {
        let mut camera = FakeCamera::new();
        let calls = camera.calls();
        let dir = tempfile::tempdir().unwrap();
        {
            let mut still = camera.capture_request().unwrap();
            let meta = still.save_jpeg(&dir.path().join("a.jpg")).unwrap();
            assert!(meta.bytes > 0);
            assert_eq!(CallCounts::get(&calls.releases), 0);
        }
        assert_eq!(CallCounts::get(&calls.releases), 1);
    }

    #[test]
    fn test_stream_drop_counts_stop() {
        let mut camera = FakeCamera::new();
        let calls = camera.calls();
        drop(camera.start_stream().unwrap());
        assert_eq!(CallCounts::get(&calls.streams_started), 1);
        assert_eq!(CallCounts::get(&calls.streams_stopped), 1);
    }
}
