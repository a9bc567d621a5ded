use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceguard::{Config, CoordinatorEvent, CoordinatorStats, RecognitionCoordinator};
use faceguard_core::{AnalyzerError, BoundingBox, Embedding, FaceAnalyzer, ImageRef};
use faceguard_hw::{Camera, CameraResourceManager, CameraState, Frame, PixelFormat, V4lBackend};
use faceguard_store::Store;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const CHECK_CONSUMER: &str = "check";

#[derive(Parser)]
#[command(name = "faceguard", about = "FaceGuard face recognition access control")]
struct Cli {
    /// Configuration file (default: $FACEGUARD_CONFIG or ~/.config/faceguard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Open the configured camera and report whether it delivers frames
    Check {
        /// Frames to read
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
        /// Save the sharpest of a few frames as PNG
        #[arg(short, long)]
        snapshot: Option<PathBuf>,
        /// Also run the recognition loop for this many seconds (dry run:
        /// no face analyzer is linked in and nothing is logged)
        #[arg(long, value_name = "SECONDS")]
        recognize: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Manage enrolled users
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },
    /// Show recent access attempts and totals
    Logs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Subcommand)]
enum UsersAction {
    /// List enrolled users
    List {
        #[arg(long)]
        json: bool,
    },
    /// Change an enrolled user's name or email
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Remove an enrolled user (their access log is kept)
    Remove { id: i64 },
}

#[derive(Serialize)]
struct CheckReport {
    device: Option<faceguard_hw::DeviceInfo>,
    state: CameraState,
    frames_requested: usize,
    frames_received: usize,
    fps: f64,
    healthy: bool,
    avg_brightness: Option<f32>,
    sharpness: Option<f64>,
    snapshot: Option<PathBuf>,
    recognition: Option<RecognitionReport>,
}

#[derive(Serialize)]
struct RecognitionReport {
    seconds: u64,
    enrolled: usize,
    results: u64,
    failures: u64,
    camera_lost: bool,
    stats: CoordinatorStats,
}

/// Stand-in for the external face analyzer: sees no faces.
struct NoFaceAnalyzer;

impl FaceAnalyzer for NoFaceAnalyzer {
    fn detect_and_encode(&self, _image: &ImageRef<'_>) -> Result<Vec<(BoundingBox, Embedding)>, AnalyzerError> {
        Ok(Vec::new())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Devices { json } => devices(json),
        Commands::Check {
            frames,
            snapshot,
            recognize,
            json,
        } => check(&config, frames, snapshot.as_deref(), recognize, json),
        Commands::Users { action } => users(&config, action),
        Commands::Logs { limit, json } => logs(&config, limit, json),
        Commands::Config => print_json(&config),
    }
}

fn devices(json: bool) -> Result<()> {
    let devices = Camera::list_devices();
    if json {
        return print_json(&devices);
    }
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for d in &devices {
        println!("/dev/video{}  {}  ({}x{})", d.index, d.name, d.width, d.height);
    }
    Ok(())
}

fn check(config: &Config, frames: usize, snapshot: Option<&Path>, recognize: Option<u64>, json: bool) -> Result<()> {
    let camera = Arc::new(CameraResourceManager::new(V4lBackend, config.manager_config()));
    if !camera.acquire(CHECK_CONSUMER) {
        camera.release(CHECK_CONSUMER);
        bail!(
            "camera /dev/video{} unavailable (state: {})",
            config.camera.index,
            camera.state()
        );
    }

    let started = Instant::now();
    let mut received = 0usize;
    let mut last: Option<Frame> = None;
    for _ in 0..frames {
        if let Some(frame) = camera.get_frame() {
            received += 1;
            last = Some(frame);
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    let healthy = camera.health_check();

    let saved = match snapshot {
        Some(path) => {
            let frame = camera
                .capture_best_frame(5)
                .context("no frame available for snapshot")?;
            save_png(&frame, path)?;
            Some(path.to_path_buf())
        }
        None => None,
    };

    let recognition = match recognize {
        Some(seconds) => Some(run_recognition(config, Arc::clone(&camera), seconds)?),
        None => None,
    };

    let report = CheckReport {
        device: camera.device_info(),
        state: camera.state(),
        frames_requested: frames,
        frames_received: received,
        fps: if elapsed > 0.0 { received as f64 / elapsed } else { 0.0 },
        healthy,
        avg_brightness: last.as_ref().map(Frame::avg_brightness),
        sharpness: last.as_ref().map(Frame::sharpness),
        snapshot: saved,
        recognition,
    };
    camera.release(CHECK_CONSUMER);

    if json {
        return print_json(&report);
    }
    if let Some(d) = &report.device {
        println!("Device:     /dev/video{} ({})", d.index, d.name);
        println!("Resolution: {}x{} @ {} fps requested", d.width, d.height, d.fps);
    }
    println!("Frames:     {}/{} ({:.1} fps)", report.frames_received, report.frames_requested, report.fps);
    println!("Healthy:    {}", if report.healthy { "yes" } else { "no" });
    if let (Some(b), Some(s)) = (report.avg_brightness, report.sharpness) {
        println!("Brightness: {b:.1}");
        println!("Sharpness:  {s:.1}");
    }
    if let Some(path) = &report.snapshot {
        println!("Snapshot:   {}", path.display());
    }
    if let Some(r) = &report.recognition {
        println!(
            "Recognition: {}s, {} enrolled, {} passes ({} failed), {} frames, {} reinitializations{}",
            r.seconds,
            r.enrolled,
            r.results,
            r.failures,
            r.stats.frames,
            r.stats.reinitializations,
            if r.camera_lost { ", camera lost" } else { "" }
        );
    }
    Ok(())
}

/// Run the recognition coordinator against the already-open camera.
fn run_recognition(config: &Config, camera: Arc<CameraResourceManager>, seconds: u64) -> Result<RecognitionReport> {
    let pipeline = config.pipeline(Arc::new(NoFaceAnalyzer))?;
    let enrolled = pipeline.reload_gallery(&open_store(config)?)?;
    let coordinator = RecognitionCoordinator::new(camera, Arc::new(pipeline), None, config.coordinator_config());
    coordinator.start()?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let (mut results, mut failures, mut camera_lost) = (0u64, 0u64, false);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match coordinator.recv_event_timeout(remaining) {
            Some(CoordinatorEvent::RecognitionResult { .. }) => results += 1,
            Some(CoordinatorEvent::RecognitionFailed { error, .. }) => {
                tracing::warn!(%error, "recognition pass failed");
                failures += 1;
            }
            Some(CoordinatorEvent::CameraLost { .. }) => {
                camera_lost = true;
                break;
            }
            None => break,
        }
    }

    let stats = coordinator.stats();
    coordinator.stop()?;
    Ok(RecognitionReport {
        seconds,
        enrolled,
        results,
        failures,
        camera_lost,
        stats,
    })
}

fn save_png(frame: &Frame, path: &Path) -> Result<()> {
    let data = frame.data.clone();
    match frame.format {
        PixelFormat::Gray8 => image::GrayImage::from_raw(frame.width, frame.height, data)
            .context("frame buffer does not match its dimensions")?
            .save(path),
        PixelFormat::Rgb8 => image::RgbImage::from_raw(frame.width, frame.height, data)
            .context("frame buffer does not match its dimensions")?
            .save(path),
    }
    .with_context(|| format!("failed to write {}", path.display()))
}

fn users(config: &Config, action: UsersAction) -> Result<()> {
    let store = open_store(config)?;
    match action {
        UsersAction::List { json } => {
            let users = store.list_users()?;
            if json {
                return print_json(&users);
            }
            if users.is_empty() {
                println!("No users enrolled");
            }
            for u in &users {
                println!(
                    "{:>4}  {:<24} {:<32} {}",
                    u.id,
                    u.name,
                    u.email,
                    u.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        UsersAction::Update { id, name, email } => {
            store.update_user(id, name.as_deref(), email.as_deref())?;
            println!("Updated user {id}");
        }
        UsersAction::Remove { id } => {
            store.delete_user(id)?;
            println!("Removed user {id}");
        }
    }
    Ok(())
}

fn logs(config: &Config, limit: usize, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let records = store.recent_logs(limit)?;
    let stats = store.stats()?;

    if json {
        return print_json(&serde_json::json!({ "stats": stats, "recent": records }));
    }
    println!(
        "Users: {}  Attempts: {} (granted {}, denied {})",
        stats.total_users, stats.total_access_logs, stats.granted, stats.denied
    );
    for r in &records {
        println!(
            "{}  {:<7}  {:>5.1}%  {}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.outcome,
            r.confidence,
            r.user_name.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<Store> {
    let path = &config.storage.db_path;
    Store::open(path).with_context(|| format!("failed to open database {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
