//! Capture-and-publish loop feeding the frame buffer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::{error, info};

use crate::capture::{Frame, FrameSource};
use crate::error::{CameraError, CameraResult};
use crate::pipeline::FrameBuffer;

/// How a broadcaster run ended
#[derive(Debug)]
pub struct BroadcastReport {
    pub frames: u64,
    /// Set when the loop died on a hardware error
    pub error: Option<CameraError>,
}

/// Handle to the running broadcaster thread
///
/// The loop checks its stop flag between frames, so shutdown latency is one
/// `capture_frame` call. Callers bound the wait with [`StreamBroadcaster::stop`].
pub struct StreamBroadcaster {
    stop: Arc<AtomicBool>,
    /// Disconnects once the thread has released the frame source
    done: flume::Receiver<()>,
    handle: Option<JoinHandle<BroadcastReport>>,
}

impl StreamBroadcaster {
    pub fn spawn(mut source: Box<dyn FrameSource>, frames: Arc<FrameBuffer>) -> CameraResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = flume::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("stream-broadcaster".into())
            .spawn({
                let stop = stop.clone();
                move || {
                    let report = broadcast(&mut *source, &frames, &stop);
                    drop(source);
                    drop(done_tx);
                    report
                }
            })?;

        Ok(Self {
            stop,
            done: done_rx,
            handle: Some(handle),
        })
    }

    /// True once the loop has exited, whether stopped or failed
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the loop to exit and wait up to `timeout` for it
    pub fn stop(self, timeout: Duration) -> CameraResult<BroadcastReport> {
        self.stop.store(true, Ordering::Release);
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Err(CameraError::hardware(format!(
                "stream broadcaster did not stop within {timeout:?}"
            ))),
            _ => self.join(),
        }
    }

    /// Collect the report of a finished loop
    pub fn join(mut self) -> CameraResult<BroadcastReport> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CameraError::hardware("stream broadcaster panicked")),
            None => Ok(BroadcastReport {
                frames: 0,
                error: None,
            }),
        }
    }
}

impl Drop for StreamBroadcaster {
    fn drop(&mut self) {
        // A broadcaster abandoned after a stop timeout still winds down.
        self.stop.store(true, Ordering::Release);
    }
}

fn broadcast(source: &mut dyn FrameSource, frames: &FrameBuffer, stop: &AtomicBool) -> BroadcastReport {
    let mut sequence = frames.sequence();
    let mut published = 0;
    info!("Stream broadcaster started at sequence {}", sequence);

    while !stop.load(Ordering::Acquire) {
        let data = match source.capture_frame() {
            Ok(data) => data,
            Err(e) => {
                error!("Capture error, stream broadcaster terminating: {}", e);
                frames.close();
                return BroadcastReport {
                    frames: published,
                    error: Some(e),
                };
            }
        };
        if stop.load(Ordering::Acquire) {
            break;
        }
        sequence += 1;
        if frames.publish(Frame::new(data, sequence)) {
            published += 1;
            metrics::counter!("pilapse_frames_published").increment(1);
        }
    }

    info!(frames = published, "Stream broadcaster stopped");
    BroadcastReport {
        frames: published,
        error: None,
    }
}
