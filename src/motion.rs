//! PIR motion sensor: a GPIO poller feeding a capture trigger
//!
//! The poller samples the sensor's output pin and turns level changes into
//! [`MotionEvent`]s on a flume channel. [`MotionTrigger`] consumes them and
//! takes a timestamped still on every start of motion. Both run on their own
//! threads and exit once the other end of the channel is gone.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rppal::gpio::{Gpio, InputPin};
use tracing::{debug, error, info};

use crate::error::CameraResult;
use crate::gallery::Gallery;
use crate::session::CameraSession;
use crate::MotionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEvent {
    Start,
    End,
}

/// Turns sampled line levels into start/end edges
#[derive(Debug, Default)]
pub struct EdgeDetector {
    last: Option<bool>,
}

impl EdgeDetector {
    pub fn update(&mut self, level: bool) -> Option<MotionEvent> {
        let previous = self.last.replace(level);
        match (previous, level) {
            (Some(true), true) | (Some(false), false) => None,
            (_, true) => Some(MotionEvent::Start),
            // A line that is low at first read is not an end of motion.
            (None, false) => None,
            (Some(true), false) => Some(MotionEvent::End),
        }
    }
}

/// Something whose logic level can be sampled
pub trait LineLevel: Send {
    fn is_high(&mut self) -> bool;
}

impl LineLevel for InputPin {
    fn is_high(&mut self) -> bool {
        InputPin::is_high(self)
    }
}

/// Samples a sensor line every `poll` and reports its edges
pub struct MotionSensor<L> {
    line: L,
    poll: Duration,
}

/// Motion sensor wired to a Raspberry Pi GPIO pin
pub type GpioMotionSensor = MotionSensor<InputPin>;

impl MotionSensor<InputPin> {
    /// Claim BCM `pin` as a pulled-down input
    pub fn open(pin: u8, poll: Duration) -> CameraResult<Self> {
        let gpio = Gpio::new()?;
        let line = gpio.get(pin)?.into_input_pulldown();
        info!("Motion sensor on GPIO {}", pin);
        Ok(Self::new(line, poll))
    }

    pub fn from_settings(settings: &MotionSettings) -> CameraResult<Self> {
        Self::open(settings.gpio_pin, settings.poll())
    }
}

impl<L: LineLevel + 'static> MotionSensor<L> {
    pub fn new(line: L, poll: Duration) -> Self {
        Self { line, poll }
    }

    pub fn spawn(self, events: flume::Sender<MotionEvent>) -> CameraResult<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("motion-sensor".into())
            .spawn(move || self.watch(&events))?;
        Ok(handle)
    }

    fn watch(mut self, events: &flume::Sender<MotionEvent>) {
        let mut edges = EdgeDetector::default();
        while !events.is_disconnected() {
            if let Some(event) = edges.update(self.line.is_high()) {
                if events.send(event).is_err() {
                    break;
                }
            }
            thread::sleep(self.poll);
        }
        debug!("Motion sensor watcher exiting");
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MotionReport {
    pub captures: u64,
    pub failures: u64,
}

/// Captures a still into the gallery whenever motion starts
pub struct MotionTrigger {
    session: Arc<CameraSession>,
    gallery: Arc<Gallery>,
    make_raw: bool,
}

impl MotionTrigger {
    pub fn new(session: Arc<CameraSession>, gallery: Arc<Gallery>, make_raw: bool) -> Self {
        Self {
            session,
            gallery,
            make_raw,
        }
    }

    /// Handle events until every sender is dropped
    pub fn run(&self, events: flume::Receiver<MotionEvent>) -> MotionReport {
        let mut report = MotionReport::default();
        for event in events.iter() {
            match event {
                MotionEvent::Start => {
                    info!("Detected movement");
                    let captured = self.gallery.next_capture(self.make_raw).and_then(|request| {
                        self.session.capture_still(&request).map_err(|e| {
                            self.gallery.discard(&request);
                            e
                        })
                    });
                    match captured {
                        Ok(meta) => {
                            report.captures += 1;
                            debug!("Motion capture {} ({} bytes)", meta.path.display(), meta.bytes);
                        }
                        Err(e) => {
                            report.failures += 1;
                            error!("Error capturing image: {}", e);
                        }
                    }
                }
                MotionEvent::End => info!("All clear"),
            }
        }
        report
    }

    pub fn spawn(self, events: flume::Receiver<MotionEvent>) -> CameraResult<JoinHandle<MotionReport>> {
        let handle = thread::Builder::new()
            .name("motion-trigger".into())
            .spawn(move || self.run(events))?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FakeCamera, CallCounts, Resolution};
    use crate::Settings;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Line whose level the test flips
    struct SharedLine(Arc<AtomicBool>);

    impl LineLevel for SharedLine {
        fn is_high(&mut self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_edges() {
        let mut edges = EdgeDetector::default();
        assert_eq!(edges.update(false), None);
        assert_eq!(edges.update(true), Some(MotionEvent::Start));
        assert_eq!(edges.update(true), None);
        assert_eq!(edges.update(false), Some(MotionEvent::End));
        assert_eq!(edges.update(false), None);
    }

    #[test]
    fn test_high_at_first_read_is_a_start() {
        let mut edges = EdgeDetector::default();
        assert_eq!(edges.update(true), Some(MotionEvent::Start));
    }

    fn trigger(camera: FakeCamera, dir: &tempfile::TempDir) -> (MotionTrigger, Arc<CameraSession>) {
        let mut settings = Settings::default();
        settings
            .camera
            .available_resolutions
            .insert("tiny".into(), Resolution::new(32, 24));
        settings.camera.resolution = "tiny".into();
        let session = Arc::new(
            CameraSession::new(Box::new(camera), &settings.camera, &settings.stream).unwrap(),
        );
        let gallery = Arc::new(Gallery::create(dir.path()).unwrap());
        (MotionTrigger::new(session.clone(), gallery, false), session)
    }

    #[test]
    fn test_trigger_captures_on_start_only() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        let calls = camera.calls();
        let (trigger, _session) = trigger(camera, &dir);

        let (tx, rx) = flume::unbounded();
        for event in [MotionEvent::Start, MotionEvent::End, MotionEvent::Start, MotionEvent::End] {
            tx.send(event).unwrap();
        }
        drop(tx);

        let report = trigger.run(rx);
        assert_eq!(report, MotionReport { captures: 2, failures: 0 });
        assert_eq!(CallCounts::get(&calls.stills), 2);
        // both land even within the same second
        assert_eq!(Gallery::create(dir.path()).unwrap().list().unwrap().len(), 2);
    }

    #[test]
    fn test_trigger_survives_capture_failure_while_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new().with_frame_interval(Duration::from_millis(5));
        let calls = camera.calls();
        let (trigger, session) = trigger(camera, &dir);
        session.start_stream().unwrap();

        let (tx, rx) = flume::unbounded();
        tx.send(MotionEvent::Start).unwrap();
        tx.send(MotionEvent::End).unwrap();
        drop(tx);

        let report = trigger.run(rx);
        assert_eq!(report, MotionReport { captures: 0, failures: 1 });
        assert_eq!(CallCounts::get(&calls.stills), 0);
        // the refused capture leaves no empty file behind
        assert!(Gallery::create(dir.path()).unwrap().list().unwrap().is_empty());
        session.stop_stream().unwrap();
    }

    #[test]
    fn test_sensor_reports_line_edges() {
        let level = Arc::new(AtomicBool::new(false));
        let (tx, rx) = flume::unbounded();
        let handle = MotionSensor::new(SharedLine(level.clone()), Duration::from_millis(5))
            .spawn(tx)
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        level.store(true, Ordering::SeqCst);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(MotionEvent::Start));
        level.store(false, Ordering::SeqCst);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(MotionEvent::End));

        drop(rx);
        handle.join().unwrap();
    }
}
