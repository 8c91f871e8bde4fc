pub mod device;
pub mod fake;
pub mod frame;
pub mod v4l2;

pub use device::{
    CameraDevice, CaptureMetadata, ControlValue, Controls, DeviceConfig, FrameSource, Purpose,
    Resolution, SensorMode, StillRequest, Transform,
};
pub use fake::{FakeCamera, CallCounts};
pub use frame::Frame;
pub use v4l2::V4l2Camera;
