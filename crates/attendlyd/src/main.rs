use anyhow::{Context, Result};
use attendly_core::detector::ScrfdDetector;
use attendly_core::encoder::ArcFaceEncoder;
use attendly_core::matcher::LinearMatcher;
use attendly_core::processor::FrameProcessor;
use attendly_core::{spawn_dispatcher, Gallery, Pipeline, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

const BUS_NAME: &str = "org.attendly.Attendance1";
const OBJECT_PATH: &str = "/org/attendly/Attendance1";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendlyd starting");

    let config = config::Config::load()?;
    let pipeline_config = config.pipeline();
    pipeline_config.validate().context("invalid pipeline configuration")?;
    let retry_policy = config.retry_policy();
    retry_policy.validate().context("invalid sink retry policy")?;

    let store = store::Store::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let gallery = Arc::new(Gallery::new());
    gallery
        .reload(store.load_identities()?)
        .context("stored identities are inconsistent")?;
    tracing::info!(identities = gallery.len(), "gallery loaded");

    let detector = ScrfdDetector::load(&config.scrfd_model_path())?;
    tracing::info!(path = %config.scrfd_model_path(), "SCRFD detector loaded");
    let encoder = ArcFaceEncoder::load(&config.arcface_model_path(), config.min_face_size)?;
    tracing::info!(path = %config.arcface_model_path(), "ArcFace encoder loaded");

    let (sink, sink_thread) = spawn_dispatcher(Box::new(store.clone()), retry_policy)?;

    let processor = FrameProcessor::new(
        Box::new(detector),
        Box::new(encoder),
        Box::new(LinearMatcher::new(Arc::clone(&gallery), &pipeline_config)?),
        &pipeline_config,
    )?;
    let pipeline = Pipeline::new(processor, &pipeline_config, sink.clone(), Box::new(SystemClock))?;

    let sources = engine::CameraFactory(engine::CaptureSettings {
        device: config.camera_device.clone(),
        width: config.frame_width,
        height: config.frame_height,
    });
    let (engine, engine_thread) = engine::spawn_engine(pipeline, Box::new(sources), Arc::clone(&gallery), store);

    let service = dbus_interface::AttendanceService {
        engine: engine.clone(),
        gallery,
        sink: sink.clone(),
    };
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, system = config.system_bus, "attendlyd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendlyd shutting down");

    // Release the camera and close open sessions, then drain the sink queue.
    if let Err(err) = engine.stop_capture().await {
        tracing::warn!(error = %err, "failed to stop capture cleanly");
    }
    drop(connection);
    drop(engine);
    if let Err(err) = sink.flush().await {
        tracing::warn!(error = %err, "attendance events may be lost");
    }
    drop(sink);

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while !(engine_thread.is_finished() && sink_thread.is_finished()) {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("worker threads still running at exit");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let _ = engine_thread.join();
    let _ = sink_thread.join();

    Ok(())
}
