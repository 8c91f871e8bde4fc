//! pilapse: camera daemon serving a live MJPEG feed, timelapses and motion captures

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pilapse::capture::{CameraDevice, FakeCamera, V4l2Camera};
use pilapse::gallery::Gallery;
use pilapse::motion::{GpioMotionSensor, MotionTrigger};
use pilapse::server::{self, AppState};
use pilapse::session::CameraSession;
use pilapse::timelapse::TimelapseController;
use pilapse::Settings;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON or TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the synthetic test-card camera instead of V4L2
    #[arg(long)]
    fake: bool,

    /// Listen address, overrides server.bind
    #[arg(short, long)]
    bind: Option<String>,

    /// Start the live stream at boot
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pilapse=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("pilapse launching...");

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }
    info!(
        "Settings: device {}, resolution {} ({}), timelapse every {:?}, gallery {}",
        settings.camera.device,
        settings.camera.resolution,
        settings.camera.selected_resolution()?,
        settings.timelapse.interval(),
        settings.gallery.dir.display()
    );

    let device: Box<dyn CameraDevice> = if args.fake {
        info!("Using synthetic camera");
        Box::new(FakeCamera::new())
    } else {
        let path = match settings.camera.device.as_str() {
            "" | "auto" => V4l2Camera::auto_detect()?,
            path => path.to_string(),
        };
        Box::new(V4l2Camera::open(&path, settings.camera.buffer_count)?)
    };

    let session = Arc::new(CameraSession::new(device, &settings.camera, &settings.stream)?);
    let gallery = Arc::new(Gallery::create(&settings.gallery.dir)?);
    let make_raw = session.raw_sidecars(settings.camera.capture_settings.make_raw);
    let timelapse = Arc::new(TimelapseController::new(
        session.clone(),
        gallery.clone(),
        make_raw,
        settings.timelapse.stop_timeout(),
    ));

    if settings.motion.enabled {
        let (tx, rx) = flume::unbounded();
        GpioMotionSensor::from_settings(&settings.motion)?.spawn(tx)?;
        MotionTrigger::new(session.clone(), gallery.clone(), make_raw).spawn(rx)?;
    }

    if args.stream {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.start_stream()).await??;
    }

    let state = AppState {
        session: session.clone(),
        timelapse: timelapse.clone(),
        gallery,
        interval: settings.timelapse.interval(),
        consumer_poll: settings.stream.consumer_poll(),
    };

    // Open MJPEG responses only finish once the stream stops, so the camera
    // is wound down before the server waits for its connections.
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for ctrl-c: {}", e);
            return;
        }
        info!("Shutdown requested");
        let stopped = tokio::task::spawn_blocking(move || {
            if let Err(e) = timelapse.shutdown() {
                warn!("Stopping timelapse: {}", e);
            }
            if let Err(e) = session.stop_stream() {
                warn!("Stopping stream: {}", e);
            }
        })
        .await;
        if let Err(e) = stopped {
            error!("Shutdown task failed: {}", e);
        }
    };

    server::serve(state, &settings.server.bind, shutdown).await?;

    info!("pilapse shutting down");
    Ok(())
}
