//! V4L2 camera backend delivering MJPEG straight from the device

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Description, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{
    CameraDevice, CaptureMetadata, ControlValue, Controls, DeviceConfig, FrameSource,
    Resolution, SensorMode, StillRequest, Transform,
};
use crate::error::{CameraError, CameraResult};

const MJPEG: &[u8; 4] = b"MJPG";

const V4L2_CID_HFLIP: u32 = 0x0098_0914;
const V4L2_CID_VFLIP: u32 = 0x0098_0915;

/// How long a dequeue may block before it counts as a hardware stall
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames thrown away before a still so exposure can settle
const STILL_WARMUP_FRAMES: usize = 3;

pub struct V4l2Camera {
    device: Device,
    buffer_count: u32,
    resolution: Option<Resolution>,
}

impl V4l2Camera {
    pub fn open(path: &str, buffer_count: u32) -> CameraResult<Self> {
        info!("Opening V4L2 camera: {}", path);

        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::hardware(format!(
                "{path} doesn't support video capture"
            )));
        }

        Ok(Self {
            device,
            buffer_count,
            resolution: None,
        })
    }

    /// First `/dev/videoN` that captures and offers MJPEG
    pub fn auto_detect() -> CameraResult<String> {
        info!("Auto-detecting capture devices...");

        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }
            if let Ok(formats) = dev.enum_formats() {
                if formats.iter().any(|fmt| fmt.fourcc == FourCC::new(MJPEG)) {
                    info!("Found MJPEG device: {} - {}", path, caps.card);
                    return Ok(path);
                }
            }
        }

        Err(CameraError::hardware("no MJPEG capture device found"))
    }

    fn control_descriptions(&self) -> CameraResult<Vec<Description>> {
        Ok(self.device.query_controls()?)
    }

    fn apply_transform(&self, transform: Transform) -> CameraResult<()> {
        let descriptions = self.control_descriptions()?;
        for (id, enabled) in [(V4L2_CID_HFLIP, transform.hflip), (V4L2_CID_VFLIP, transform.vflip)] {
            if !descriptions.iter().any(|d| d.id == id) {
                if enabled {
                    warn!("Device has no flip control {:#x}, ignoring", id);
                }
                continue;
            }
            self.device.set_control(Control {
                id,
                value: Value::Boolean(enabled),
            })?;
        }
        Ok(())
    }

    fn open_stream(&self, buffers: u32) -> CameraResult<MmapStream<'static>> {
        let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, buffers)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        Ok(stream)
    }

    fn current_resolution(&self) -> CameraResult<Resolution> {
        self.resolution
            .ok_or_else(|| CameraError::hardware("camera used before being configured"))
    }
}

impl CameraDevice for V4l2Camera {
    fn supported_modes(&self) -> CameraResult<Vec<SensorMode>> {
        let fourcc = FourCC::new(MJPEG);
        let mut modes = Vec::new();
        for size in self.device.enum_framesizes(fourcc)? {
            let size = match size.size {
                FrameSizeEnum::Discrete(d) => Resolution::new(d.width, d.height),
                FrameSizeEnum::Stepwise(s) => Resolution::new(s.max_width, s.max_height),
            };
            modes.push(SensorMode {
                size,
                format: String::from_utf8_lossy(MJPEG).into_owned(),
                bit_depth: None,
            });
        }
        Ok(modes)
    }

    fn supported_controls(&self) -> CameraResult<Vec<String>> {
        Ok(self
            .control_descriptions()?
            .into_iter()
            .map(|d| d.name)
            .collect())
    }

    #[instrument(skip(self))]
    fn configure(&mut self, config: &DeviceConfig) -> CameraResult<()> {
        let mut fmt = self.device.format()?;
        fmt.width = config.resolution.width;
        fmt.height = config.resolution.height;
        fmt.fourcc = FourCC::new(MJPEG);

        let actual = self.device.set_format(&fmt)?;
        if actual.fourcc != FourCC::new(MJPEG) {
            return Err(CameraError::hardware("device refused MJPEG output"));
        }
        if (actual.width, actual.height) != (fmt.width, fmt.height) {
            warn!(
                "Driver adjusted {} to {}x{}",
                config.resolution, actual.width, actual.height
            );
        }
        if let Some(mode) = &config.sensor_mode {
            // The driver picks binning itself; the mode is informational here.
            debug!("Requested sensor mode {} {}", mode.size, mode.format);
        }

        self.apply_transform(config.transform)?;
        self.resolution = Some(Resolution::new(actual.width, actual.height));
        Ok(())
    }

    fn set_controls(&mut self, controls: &Controls) -> CameraResult<()> {
        let descriptions = self.control_descriptions()?;
        for (name, value) in controls {
            let Some(desc) = descriptions.iter().find(|d| &d.name == name) else {
                warn!("Unknown control {}, skipping", name);
                continue;
            };
            let value = match *value {
                ControlValue::Bool(b) => Value::Boolean(b),
                ControlValue::Int(i) => Value::Integer(i),
                ControlValue::Float(f) => Value::Integer(f.round() as i64),
            };
            self.device.set_control(Control { id: desc.id, value })?;
            debug!("Set control {} ({:#x})", name, desc.id);
        }
        Ok(())
    }

    fn start_stream(&mut self) -> CameraResult<Box<dyn FrameSource>> {
        self.current_resolution()?;
        let stream = self.open_stream(self.buffer_count)?;
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(Box::new(V4l2FrameSource { stream }))
    }

    #[instrument(skip(self))]
    fn capture_request(&mut self) -> CameraResult<Box<dyn StillRequest + '_>> {
        let size = self.current_resolution()?;
        let mut stream = self.open_stream(2)?;
        for _ in 0..STILL_WARMUP_FRAMES {
            stream.next()?;
        }
        let data = dequeue_jpeg(&mut stream)?;
        Ok(Box::new(V4l2Still {
            _stream: stream,
            data,
            size,
        }))
    }

    /// The device hands out compressed frames only
    fn supports_raw(&self) -> bool {
        false
    }
}

fn dequeue_jpeg(stream: &mut MmapStream<'static>) -> CameraResult<Bytes> {
    let (buf, meta) = stream.next()?;
    let used = match meta.bytesused as usize {
        0 => buf.len(),
        n => n.min(buf.len()),
    };
    Ok(Bytes::copy_from_slice(&buf[..used]))
}

struct V4l2FrameSource {
    stream: MmapStream<'static>,
}

impl FrameSource for V4l2FrameSource {
    fn capture_frame(&mut self) -> CameraResult<Bytes> {
        dequeue_jpeg(&mut self.stream)
    }
}

/// Holds the capture stream open until the request is released
struct V4l2Still {
    _stream: MmapStream<'static>,
    data: Bytes,
    size: Resolution,
}

impl StillRequest for V4l2Still {
    fn save_jpeg(&mut self, path: &Path) -> CameraResult<CaptureMetadata> {
        std::fs::write(path, &self.data)?;
        Ok(CaptureMetadata {
            path: path.to_path_buf(),
            size: self.size,
            bytes: self.data.len(),
            captured_at: Utc::now(),
        })
    }

    fn save_raw(&mut self, _path: &Path) -> CameraResult<()> {
        Err(CameraError::hardware(
            "raw sensor data is not available from a V4L2 MJPEG device",
        ))
    }
}
