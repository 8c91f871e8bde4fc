//! Error kinds surfaced by the camera core

use crate::session::CameraMode;

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// A mode transition was requested from an incompatible mode
    #[error("cannot {operation} while camera is {mode}")]
    InvalidState {
        operation: &'static str,
        mode: CameraMode,
    },

    /// Any I/O, encode or configure failure reported by the camera hardware,
    /// timeouts included
    #[error("camera hardware error: {0}")]
    Hardware(String),

    /// Malformed or missing settings
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CameraError {
    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::Hardware(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

impl From<std::io::Error> for CameraError {
    fn from(e: std::io::Error) -> Self {
        Self::Hardware(e.to_string())
    }
}

impl From<image::ImageError> for CameraError {
    fn from(e: image::ImageError) -> Self {
        Self::Hardware(format!("encode failed: {e}"))
    }
}

impl From<rppal::gpio::Error> for CameraError {
    fn from(e: rppal::gpio::Error) -> Self {
        Self::Hardware(format!("gpio: {e}"))
    }
}

impl From<config::ConfigError> for CameraError {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message_names_mode() {
        let err = CameraError::InvalidState {
            operation: "capture a still",
            mode: CameraMode::Streaming,
        };
        assert_eq!(err.to_string(), "cannot capture a still while camera is streaming");
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_io_error_maps_to_hardware() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "dequeue timed out");
        let err: CameraError = io.into();
        assert!(matches!(err, CameraError::Hardware(ref m) if m.contains("dequeue timed out")));
    }
}
