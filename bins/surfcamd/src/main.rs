//! surfcamd — main daemon for the surf camera.
//!
//! Wires the shared state bus to the two long-running tasks: the tracking
//! loop (which owns both serial links) and the video recorder. Each task
//! runs on its own OS thread because both block on hardware; the async
//! runtime only hosts signal handling.

mod config;

use anyhow::Result;
use bus::StateBus;
use clap::Parser;
use config::SurfcamConfig;
use recording::Recorder;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "surfcamd", about = "Surf camera tracking daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/surfcam.toml")]
    config: PathBuf,

    /// Persisted-state file. Overrides config file.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Videos root directory. Overrides config file.
    #[arg(long)]
    videos_root: Option<PathBuf>,

    /// Log directory. Overrides config file.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Run without the video recorder (tracking and motion only)
    #[arg(long)]
    no_video: bool,
}

/// How long tasks get to park their hardware after a stop request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = SurfcamConfig::load(&args.config)?;
    if let Some(state_file) = args.state_file {
        config.daemon.state_file = state_file;
    }
    if let Some(videos_root) = args.videos_root {
        config.recording.videos_root = videos_root;
    }
    if let Some(log_dir) = args.log_dir {
        config.daemon.log_dir = log_dir;
    }

    let file_appender = tracing_appender::rolling::daily(&config.daemon.log_dir, "surfcamd.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("surfcamd=info".parse().unwrap())
                .add_directive("tracking=info".parse().unwrap())
                .add_directive("recording=info".parse().unwrap()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!(config = %args.config.display(), "Starting surfcamd");

    let bus = StateBus::new();
    if let Err(e) = bus.load(&config.daemon.state_file) {
        warn!(?e, "Persisted state load failed, continuing with defaults");
    }

    // Old sessions make way for new ones before anything records.
    recording::prune_old_sessions(
        &config.recording.videos_root,
        config.recording.max_session_age_days,
    );

    let tracking_config = config.tracking_config();
    let tracking_handle = std::thread::Builder::new()
        .name("tracking".into())
        .spawn({
            let bus = bus.clone();
            move || tracking::run(bus, tracking_config)
        })?;

    let recorder_handle = if args.no_video {
        info!("Video recorder disabled");
        None
    } else {
        let recording_config = config.recording_config();
        let bus = bus.clone();
        Some(
            std::thread::Builder::new()
                .name("recorder".into())
                .spawn(move || Recorder::new(bus, recording_config).run())?,
        )
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    bus.request_stop();

    // Every task safes its hardware and exits on its own; past the grace
    // period the process goes down regardless.
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    let mut handles = vec![("tracking", tracking_handle)];
    if let Some(handle) = recorder_handle {
        handles.push(("recorder", handle));
    }
    for (name, handle) in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!(task = name, "Task did not stop within the grace period");
        }
    }

    // Operator tuning (tilt offset, zoom multiplier, camera height) should
    // survive the restart even if no calibration ran this session.
    bus.snapshot(bus::PERSISTED_KEYS, &config.daemon.state_file);

    info!("Shutdown complete");
    Ok(())
}
