//! Timelapse: a background thread capturing stills at a fixed interval
//!
//! Stop is cooperative. The interval wait is cancellable, so a stop request
//! is noticed at the latest after the capture that is in flight when it
//! arrives. [`TimelapseController::stop`] bounds how long it waits for that.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::RecvTimeoutError;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{CameraError, CameraResult};
use crate::gallery::Gallery;
use crate::session::{CameraMode, CameraSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

impl StartOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            StartOutcome::Started => "Timelapse started successfully",
            StartOutcome::AlreadyRunning => "Timelapse is already running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

impl StopOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            StopOutcome::Stopped => "Timelapse stopped",
            StopOutcome::NotRunning => "Timelapse is not running",
        }
    }
}

/// Result of a stream start requested through the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStart {
    Started,
    /// Refused: the camera belongs to the running timelapse
    TimelapseRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelapseStatus {
    pub running: bool,
    pub interval_secs: Option<f64>,
    /// Capture attempts of the current or most recent job
    pub attempts: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    failures: AtomicU64,
}

/// The one running timelapse
struct TimelapseJob {
    interval: Duration,
    stop_tx: flume::Sender<()>,
    /// Disconnects when the thread exits
    done_rx: flume::Receiver<()>,
    handle: JoinHandle<()>,
    /// Stream was running when the job started
    resume_stream: bool,
}

pub struct TimelapseController {
    session: Arc<CameraSession>,
    gallery: Arc<Gallery>,
    make_raw: bool,
    stop_timeout: Duration,
    job: Mutex<Option<TimelapseJob>>,
    counters: Arc<Counters>,
}

impl TimelapseController {
    pub fn new(
        session: Arc<CameraSession>,
        gallery: Arc<Gallery>,
        make_raw: bool,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            session,
            gallery,
            make_raw,
            stop_timeout,
            job: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<TimelapseJob>> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|job| !job.handle.is_finished())
    }

    pub fn status(&self) -> TimelapseStatus {
        let job = self.lock();
        let running = job.as_ref().filter(|job| !job.handle.is_finished());
        TimelapseStatus {
            running: running.is_some(),
            interval_secs: running.map(|job| job.interval.as_secs_f64()),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Start capturing every `interval`. A second start while a job runs
    /// changes nothing and reports [`StartOutcome::AlreadyRunning`].
    ///
    /// A running stream is stopped for the job's lifetime and restarted by
    /// [`TimelapseController::stop`].
    pub fn start(&self, interval: Duration) -> CameraResult<StartOutcome> {
        if interval.is_zero() {
            return Err(CameraError::configuration(
                "timelapse interval must be greater than zero",
            ));
        }

        let mut job = self.lock();
        // A job whose stop timed out may have finished since; it still owes
        // the stream a restart.
        let mut resume_stream = false;
        match job.take() {
            Some(running) if !running.handle.is_finished() => {
                info!("Timelapse is already running");
                *job = Some(running);
                return Ok(StartOutcome::AlreadyRunning);
            }
            Some(finished) => {
                resume_stream = finished.resume_stream;
                if finished.handle.join().is_err() {
                    error!("Previous timelapse thread panicked");
                }
            }
            None => {}
        }

        if self.session.mode() == CameraMode::Streaming {
            resume_stream = true;
            info!("Stopping stream for the timelapse");
            if let Err(e) = self.session.stop_stream() {
                warn!("Stream stop before timelapse: {}", e);
            }
        }

        self.counters.attempts.store(0, Ordering::Relaxed);
        self.counters.failures.store(0, Ordering::Relaxed);

        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        let session = self.session.clone();
        let gallery = self.gallery.clone();
        let counters = self.counters.clone();
        let make_raw = self.make_raw;

        let handle = thread::Builder::new()
            .name("timelapse".into())
            .spawn(move || {
                take_lapse(&session, &gallery, make_raw, interval, &stop_rx, &counters);
                drop(done_tx);
            })?;

        *job = Some(TimelapseJob {
            interval,
            stop_tx,
            done_rx,
            handle,
            resume_stream,
        });
        Ok(StartOutcome::Started)
    }

    /// Stop the job, wait for its thread, and restart the stream if the job
    /// had stopped it. Safe to call when nothing is running.
    pub fn stop(&self) -> CameraResult<StopOutcome> {
        self.halt(true)
    }

    /// Stop without restarting the stream, for process shutdown
    pub fn shutdown(&self) -> CameraResult<StopOutcome> {
        self.halt(false)
    }

    /// Start the live stream unless a timelapse owns the camera. The check
    /// and the start happen under the job lock, so a timelapse starting
    /// concurrently cannot have its stream pause undone.
    pub fn start_stream(&self) -> CameraResult<StreamStart> {
        let job = self.lock();
        if job.as_ref().is_some_and(|job| !job.handle.is_finished()) {
            info!("Stream start refused, timelapse is running");
            return Ok(StreamStart::TimelapseRunning);
        }
        self.session.start_stream()?;
        Ok(StreamStart::Started)
    }

    fn halt(&self, resume: bool) -> CameraResult<StopOutcome> {
        let mut slot = self.lock();
        let Some(job) = slot.as_ref() else {
            return Ok(StopOutcome::NotRunning);
        };

        // A full channel means a stop is already pending. The job stays in
        // its slot until the thread is gone, so a later stop can finish it.
        let _ = job.stop_tx.try_send(());
        if let Err(RecvTimeoutError::Timeout) = job.done_rx.recv_timeout(self.stop_timeout) {
            return Err(CameraError::hardware(format!(
                "timelapse did not stop within {:?}",
                self.stop_timeout
            )));
        }
        let Some(job) = slot.take() else {
            return Ok(StopOutcome::NotRunning);
        };
        if job.handle.join().is_err() {
            error!("Timelapse thread panicked");
        }
        drop(slot);

        if resume && job.resume_stream {
            info!("Restarting stream after timelapse");
            self.session.start_stream()?;
        }
        Ok(StopOutcome::Stopped)
    }
}

fn take_lapse(
    session: &CameraSession,
    gallery: &Gallery,
    make_raw: bool,
    interval: Duration,
    stop: &flume::Receiver<()>,
    counters: &Counters,
) {
    info!("Timelapse started, one image every {:?}", interval);
    loop {
        counters.attempts.fetch_add(1, Ordering::Relaxed);
        let captured = gallery.next_capture(make_raw).and_then(|request| {
            session.capture_still(&request).map_err(|e| {
                gallery.discard(&request);
                e
            })
        });
        if let Err(e) = captured {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            error!("Error capturing image: {}", e);
        }

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    info!(
        "Timelapse stopped after {} captures",
        counters.attempts.load(Ordering::Relaxed)
    );
}
