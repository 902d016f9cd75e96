use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{
    config::DetectionConfig, FaceDetector, FacePipeline, FaceRecognizer, InferenceConfig,
    PipelineConfig, StabilizedFace, TemporalStabilizer, UserSnapshot,
};
use facegate_hw::{frame, Camera};
use facegate_store::UserStore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face access-control CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate the person in front of the camera
    Authenticate,
    /// Register a new user from the camera
    Register {
        /// Unique user name
        name: String,
    },
    /// List registered users
    Users,
    /// Grant or revoke a user's access
    Toggle {
        name: String,
    },
    /// Delete a registered user
    Remove {
        name: String,
    },
    /// Show daemon status
    Status,
    /// Live recognition preview straight from the camera (no daemon)
    Preview {
        #[command(flatten)]
        local: LocalArgs,
        /// Write the last annotated frame here on exit (format from extension)
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,
    },
    /// List every raw detector candidate in one frame (no daemon)
    Probe {
        #[command(flatten)]
        local: LocalArgs,
    },
}

/// Settings for commands that open the camera and models directly.
#[derive(clap::Args)]
struct LocalArgs {
    /// V4L2 device; probes /dev/video0..4 when omitted
    #[arg(long, env = "FACEGATE_CAMERA_DEVICE")]
    device: Option<String>,
    /// Directory containing the ONNX models
    #[arg(long, env = "FACEGATE_MODEL_DIR")]
    models: Option<PathBuf>,
    /// User database to match against
    #[arg(long, env = "FACEGATE_DB_PATH")]
    db: Option<PathBuf>,
    /// Frames to discard while exposure settles
    #[arg(long, default_value_t = 4)]
    warmup: usize,
}

impl LocalArgs {
    fn model_dir(&self) -> PathBuf {
        self.models
            .clone()
            .unwrap_or_else(facegate_core::default_model_dir)
    }

    fn open_camera(&self) -> Result<Camera> {
        let camera = match &self.device {
            Some(d) => Camera::open(d)?,
            None => Camera::open_first_available()?,
        };
        println!(
            "Camera: {} ({}x{}, {:?})",
            camera.device_path, camera.width, camera.height, camera.fourcc
        );
        Ok(camera)
    }
}

#[zbus::proxy(
    interface = "org.facegate.Facegate1",
    default_service = "org.facegate.Facegate1",
    default_path = "/org/facegate/Facegate1"
)]
trait Facegate {
    async fn authenticate(&self) -> zbus::Result<String>;
    async fn register(&self, name: &str) -> zbus::Result<String>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn toggle_access(&self, name: &str) -> zbus::Result<bool>;
    async fn remove_user(&self, name: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn connect() -> Result<FacegateProxy<'static>> {
    let conn = if std::env::var_os("FACEGATE_SESSION_BUS").is_some() {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    FacegateProxy::new(&conn)
        .await
        .context("facegated is not running")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Authenticate => {
            println!("Look at the camera...");
            let reply: serde_json::Value =
                serde_json::from_str(&connect().await?.authenticate().await?)?;
            println!("{}", reply["message"].as_str().unwrap_or("no response message"));
            if reply["success"] != true {
                std::process::exit(1);
            }
        }
        Commands::Register { name } => {
            println!("Registering {name}. Look at the camera...");
            let reply: serde_json::Value =
                serde_json::from_str(&connect().await?.register(&name).await?)?;
            println!("{}", reply["message"].as_str().unwrap_or("no response message"));
            if reply["success"] != true {
                std::process::exit(1);
            }
            if reply["access"] == false {
                println!("Access is pending approval: facegate toggle {name}");
            }
        }
        Commands::Users => {
            let users: serde_json::Value =
                serde_json::from_str(&connect().await?.list_users().await?)?;
            print_users(&users);
        }
        Commands::Toggle { name } => {
            let access = connect().await?.toggle_access(&name).await?;
            let state = if access { "granted" } else { "revoked" };
            println!("Access for {name}: {state}");
        }
        Commands::Remove { name } => {
            if connect().await?.remove_user(&name).await? {
                println!("Removed {name}");
            } else {
                bail!("no such user: {name}");
            }
        }
        Commands::Status => {
            let status: serde_json::Value =
                serde_json::from_str(&connect().await?.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Preview {
            local,
            snapshot,
            frames,
        } => {
            let stop = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&stop);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    flag.store(true, Ordering::Relaxed);
                }
            });
            tokio::task::spawn_blocking(move || {
                run_preview(&local, snapshot.as_deref(), frames, &stop)
            })
            .await??;
        }
        Commands::Probe { local } => {
            tokio::task::spawn_blocking(move || run_probe(&local)).await??;
        }
    }

    Ok(())
}

fn print_users(users: &serde_json::Value) {
    let Some(list) = users.as_array().filter(|l| !l.is_empty()) else {
        println!("No users registered");
        return;
    };
    println!("{:<6} {:<24} {:<8} CREATED", "ID", "NAME", "ACCESS");
    for u in list {
        println!(
            "{:<6} {:<24} {:<8} {}",
            u["id"],
            u["name"].as_str().unwrap_or("?"),
            if u["access"] == true { "yes" } else { "no" },
            u["created_at"].as_str().unwrap_or(""),
        );
    }
}

fn load_snapshot(db: Option<&Path>) -> Result<UserSnapshot> {
    let Some(db) = db else {
        println!("No user database given; every face will be unknown");
        return Ok(UserSnapshot::default());
    };
    let store = UserStore::open(db).with_context(|| format!("opening {}", db.display()))?;
    Ok(store.list_enrolled_users()?)
}

/// Stabilized recognition loop. Runs until Ctrl-C or the frame limit.
fn run_preview(
    local: &LocalArgs,
    snapshot_path: Option<&Path>,
    max_frames: Option<u64>,
    stop: &AtomicBool,
) -> Result<()> {
    let config = PipelineConfig::default();
    let inference = InferenceConfig::default();
    let model_dir = local.model_dir();

    let users = load_snapshot(local.db.as_deref())?;
    println!("Loaded {} user(s)", users.len());

    let detector = FaceDetector::load(
        &model_dir.join(facegate_core::DETECTOR_MODEL_FILE).to_string_lossy(),
        config.detection.clone(),
        &inference,
    )?;
    let recognizer = FaceRecognizer::load(
        &model_dir
            .join(facegate_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy(),
        config.embedding.clone(),
        &inference,
    )?;
    let mut pipeline = FacePipeline::new(detector, recognizer, &config);
    let mut stabilizer = TemporalStabilizer::new(config.stabilizer.clone());

    let camera = local.open_camera()?;
    let mut stream = camera.stream()?;
    stream.discard(local.warmup);
    println!("Preview running, Ctrl-C to stop");

    let mut shown: Option<String> = None;
    let mut last_frame = None;
    let mut count = 0u64;
    let mut failures = 0u32;

    while !stop.load(Ordering::Relaxed) && max_frames.map_or(true, |max| count < max) {
        let mut frame = match stream.capture() {
            Ok(f) => {
                failures = 0;
                f
            }
            Err(e) => {
                tracing::debug!(error = %e, failures, "frame read failed");
                std::thread::sleep(read_retry_delay(failures));
                failures = failures.saturating_add(1);
                continue;
            }
        };
        count += 1;

        let face = pipeline.preview_frame(&mut stabilizer, &frame, &users)?;
        if let Some(line) = label_transition(&mut shown, face) {
            println!("[frame {count}] {line}");
        }
        if snapshot_path.is_some() {
            if let Some(face) = face {
                frame::draw_box(&mut frame, &face.bbox, face.color, 2);
            }
            last_frame = Some(frame);
        }
    }

    println!("Preview stopped after {count} frame(s)");
    if let (Some(path), Some(frame)) = (snapshot_path, last_frame) {
        frame::save_snapshot(&frame, path)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        println!("Snapshot written to {}", path.display());
    }
    Ok(())
}

/// Back-off after consecutive failed reads: 10ms doubling, capped at 500ms.
fn read_retry_delay(consecutive_failures: u32) -> Duration {
    let ms = 10u64.saturating_mul(1 << consecutive_failures.min(6));
    Duration::from_millis(ms.min(500))
}

/// The line to print when the displayed label changes, if it did.
fn label_transition(shown: &mut Option<String>, face: Option<&StabilizedFace>) -> Option<String> {
    let current = face.map(|f| f.label.clone());
    if *shown == current {
        return None;
    }
    *shown = current;
    Some(shown.clone().unwrap_or_else(|| "no face".to_string()))
}

/// Dump every detector candidate with relaxed size filtering.
fn run_probe(local: &LocalArgs) -> Result<()> {
    let devices = Camera::list_devices();
    println!("{} capture device(s):", devices.len());
    for d in &devices {
        println!("  {}: {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let production = DetectionConfig::default();
    let model = local.model_dir().join(facegate_core::DETECTOR_MODEL_FILE);
    let mut detector = FaceDetector::load(
        &model.to_string_lossy(),
        production.diagnostic(),
        &InferenceConfig::default(),
    )?;

    let camera = local.open_camera()?;
    let mut stream = camera.stream()?;
    stream.discard(local.warmup);
    let frame = stream.capture()?;

    let candidates = detector.candidates(&frame)?;
    if candidates.is_empty() {
        println!("No candidates above confidence {}", production.confidence_threshold);
        return Ok(());
    }

    println!("{} candidate(s), best first:", candidates.len());
    for (i, d) in candidates.iter().enumerate() {
        let (w, h) = (d.bbox.width(), d.bbox.height());
        let usable = (w as f32) >= production.min_box_size && (h as f32) >= production.min_box_size;
        println!(
            "  #{i}: conf={:.3} box=({}, {})-({}, {}) size={w}x{h}{}",
            d.confidence,
            d.bbox.x1,
            d.bbox.y1,
            d.bbox.x2,
            d.bbox.y2,
            if usable { "" } else { " (too small for recognition)" },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::BoundingBox;

    fn face(label: &str) -> StabilizedFace {
        StabilizedFace {
            bbox: BoundingBox { x1: 0, y1: 0, x2: 60, y2: 60 },
            label: label.to_string(),
            color: [0, 255, 0],
            access: true,
        }
    }

    #[test]
    fn test_label_transitions_print_once() {
        let mut shown = None;
        let alice = face("alice (0.210)");
        assert_eq!(label_transition(&mut shown, None), None);
        assert_eq!(
            label_transition(&mut shown, Some(&alice)).as_deref(),
            Some("alice (0.210)")
        );
        assert_eq!(label_transition(&mut shown, Some(&alice)), None);
        assert_eq!(label_transition(&mut shown, None).as_deref(), Some("no face"));
    }

    #[test]
    fn test_read_retry_delay_backs_off_and_caps() {
        assert_eq!(read_retry_delay(0), Duration::from_millis(10));
        assert_eq!(read_retry_delay(1), Duration::from_millis(20));
        assert_eq!(read_retry_delay(5), Duration::from_millis(320));
        assert_eq!(read_retry_delay(6), Duration::from_millis(500));
        assert_eq!(read_retry_delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_cli_parses_local_args() {
        let cli = Cli::try_parse_from([
            "facegate",
            "preview",
            "--device",
            "/dev/video1",
            "--snapshot",
            "out.jpg",
            "--frames",
            "30",
        ])
        .unwrap();
        match cli.command {
            Commands::Preview {
                local,
                snapshot,
                frames,
            } => {
                assert_eq!(local.device.as_deref(), Some("/dev/video1"));
                assert_eq!(local.warmup, 4);
                assert_eq!(snapshot, Some(PathBuf::from("out.jpg")));
                assert_eq!(frames, Some(30));
            }
            _ => panic!("expected preview"),
        }
    }
}
