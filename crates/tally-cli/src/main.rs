use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tally_core::collector::SAMPLES_PER_SESSION;
use tally_core::ledger::{format_date, parse_date};
use tally_core::recognition::AttendanceEvent;
use tally_core::{
    AttendanceLedger, CascadeDetector, ClassifierError, FaceLocator, FrameFeedback, KnnClassifier,
    MarkOutcome, Phase, RecognitionLoop, SampleCollector,
};
use tally_hw::{Camera, Frame, FrameSource};
use tally_store::EnrollmentStore;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{FrameHandler, SourceSpec};

#[derive(Parser)]
#[command(name = "tally", version, about = "Webcam face enrollment and attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for a person and add them to the enrollment store
    Enroll {
        /// Name to enroll the face under
        #[arg(short, long)]
        name: String,
        /// Replay images from this directory instead of the camera
        #[arg(long)]
        frames_dir: Option<PathBuf>,
        /// Abandon the session after this many seconds (0 = wait forever)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Recognize faces and mark attendance once per person per day
    Attend {
        /// Replay images from this directory instead of the camera
        #[arg(long)]
        frames_dir: Option<PathBuf>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Keep the latest annotated frame written to this image file
        #[arg(long)]
        preview: Option<PathBuf>,
    },
    /// Show today's attendance
    Today,
    /// Show attendance for a given day
    Show {
        /// Day in DD-MM-YYYY form
        #[arg(short, long)]
        date: String,
    },
    /// List enrolled people
    List,
    /// Print configuration and store status as JSON
    Status,
    /// Run camera diagnostics
    Test {
        /// Frames to grab after warmup
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::Enroll {
            name,
            frames_dir,
            timeout,
        } => enroll(&config, &name, frames_dir, timeout).await,
        Commands::Attend {
            frames_dir,
            duration,
            preview,
        } => attend(&config, frames_dir, duration, preview).await,
        Commands::Today => show(&config, Local::now().date_naive()),
        Commands::Show { date } => {
            let date = parse_date(&date)
                .with_context(|| format!("invalid date {date:?}, expected DD-MM-YYYY"))?;
            show(&config, date)
        }
        Commands::List => list(&config),
        Commands::Status => status(&config),
        Commands::Test { frames } => {
            let config = config.clone();
            tokio::task::spawn_blocking(move || camera_test(&config, frames)).await?
        }
    }
}

fn load_locator(config: &Config) -> Result<Arc<dyn FaceLocator>> {
    let path = config.cascade_path();
    let detector = CascadeDetector::load(&path.to_string_lossy())
        .with_context(|| format!("loading face cascade {}", path.display()))?;
    Ok(Arc::new(detector))
}

fn open_store(config: &Config) -> Result<EnrollmentStore> {
    EnrollmentStore::open(&config.db_path)
        .with_context(|| format!("opening enrollment store {}", config.db_path.display()))
}

fn open_ledger(config: &Config) -> Result<AttendanceLedger> {
    let backend = tally_store::open_attendance(
        config.attendance_backend,
        &config.db_path,
        &config.attendance_dir,
    )
    .with_context(|| format!("opening {} attendance backend", config.attendance_backend))?;
    Ok(AttendanceLedger::new(backend))
}

fn source_spec(config: &Config, frames_dir: Option<PathBuf>) -> SourceSpec {
    match frames_dir {
        Some(dir) => SourceSpec::Directory {
            dir,
            pace: Duration::from_millis(config.replay_interval_ms),
        },
        None => SourceSpec::Camera {
            device: config.camera_device.clone(),
            width: config.frame_width,
            height: config.frame_height,
            warmup_frames: config.warmup_frames,
        },
    }
}

// --- enroll ---

struct EnrollHandler {
    collector: Arc<SampleCollector>,
}

impl FrameHandler for EnrollHandler {
    fn on_frame(&mut self, frame: Frame) -> ControlFlow<()> {
        match self.collector.on_frame(&frame.image) {
            FrameFeedback::Captured { captured } if captured >= SAMPLES_PER_SESSION => {
                ControlFlow::Break(())
            }
            FrameFeedback::Inactive => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }
}

async fn enroll(
    config: &Config,
    name: &str,
    frames_dir: Option<PathBuf>,
    timeout: Option<u64>,
) -> Result<()> {
    let locator = load_locator(config)?;
    let store = open_store(config)?;

    let collector = Arc::new(SampleCollector::new(locator));
    collector.begin(name)?;
    let name = name.trim();

    let handler = EnrollHandler {
        collector: collector.clone(),
    };
    let capture = engine::spawn_capture(source_spec(config, frames_dir), handler)
        .await
        .context("starting capture")?;

    println!("Capturing {SAMPLES_PER_SESSION} face samples for {name}; look at the camera.");

    let timeout_secs = timeout.unwrap_or(config.enroll_timeout_secs);
    let deadline = (timeout_secs > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(timeout_secs));
    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut reported = 0;
    let stopped_early = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let progress = collector.progress();
                if progress.captured > reported {
                    reported = progress.captured;
                    println!("  sample {}/{}", progress.captured, progress.target);
                }
                if progress.phase == Phase::Complete {
                    break None;
                }
                if capture.is_finished() {
                    break Some("frame source ended");
                }
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    break Some("timed out");
                }
            }
            _ = &mut ctrl_c => break Some("interrupted"),
        }
    };

    let (_, stats) = capture.join().await?;
    tracing::debug!(delivered = stats.delivered, dark_skipped = stats.dark_skipped, "enroll capture done");

    if collector.progress().phase != Phase::Complete {
        let progress = collector.progress();
        collector.abandon();
        bail!(
            "enrollment for {name} {} after {}/{} samples; nothing was saved",
            stopped_early.unwrap_or("stopped"),
            progress.captured,
            progress.target
        );
    }

    match collector.commit(&store)? {
        Some(receipt) => {
            println!(
                "Saved {} samples for {} ({} stored in total).",
                receipt.captured, receipt.identity, receipt.total_samples
            );
            Ok(())
        }
        None => bail!("enrollment session was not complete"),
    }
}

// --- attend ---

struct AttendHandler {
    recognition: RecognitionLoop,
    events: mpsc::Sender<AttendanceEvent>,
    preview: Option<PathBuf>,
}

impl FrameHandler for AttendHandler {
    fn on_frame(&mut self, frame: Frame) -> ControlFlow<()> {
        let report = self.recognition.process_frame(frame.image, Local::now());
        for event in report.events {
            if self.events.blocking_send(event).is_err() {
                return ControlFlow::Break(());
            }
        }
        if let Some(path) = &self.preview {
            if let Err(e) = write_preview(path, &report.frame) {
                tracing::warn!(path = %path.display(), error = %e, "preview write failed");
            }
        }
        ControlFlow::Continue(())
    }
}

/// Write via a sibling temp file so viewers never see a partial image.
fn write_preview(path: &Path, frame: &image::RgbImage) -> Result<()> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("png");
    let tmp = path.with_extension(format!("tmp.{ext}"));
    frame.save(&tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

async fn attend(
    config: &Config,
    frames_dir: Option<PathBuf>,
    duration: Option<u64>,
    preview: Option<PathBuf>,
) -> Result<()> {
    let locator = load_locator(config)?;
    let store = open_store(config)?;

    let classifier = match KnnClassifier::load(&store) {
        Ok(model) => Arc::new(model),
        Err(ClassifierError::NoEnrollmentData) => {
            println!("No enrollment data yet. Register a face first with `tally enroll --name NAME`.");
            return Ok(());
        }
        Err(e) => return Err(e).context("training classifier"),
    };
    println!(
        "Loaded {} samples for {} people.",
        classifier.sample_count(),
        classifier.identities().len()
    );

    let ledger = Arc::new(open_ledger(config)?);
    let recognition = RecognitionLoop::new(locator, classifier, ledger.clone());
    let run_id = recognition.run_id();

    let (tx, mut rx) = mpsc::channel::<AttendanceEvent>(32);
    let handler = AttendHandler {
        recognition,
        events: tx,
        preview,
    };
    let capture = engine::spawn_capture(source_spec(config, frames_dir), handler)
        .await
        .context("starting capture")?;

    println!("Recognition running (run {run_id}); press Ctrl-C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let until = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(until);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));

    loop {
        tokio::select! {
            Some(event) = rx.recv() => print_event(&event),
            _ = ticker.tick() => {
                if capture.is_finished() {
                    break;
                }
            }
            _ = &mut ctrl_c => break,
            _ = &mut until => break,
        }
    }

    let (handler, stats) = capture.join().await?;
    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }

    let seen = handler.recognition.finish();
    tracing::debug!(delivered = stats.delivered, dark_skipped = stats.dark_skipped, "attend capture done");
    println!(
        "Recognition stopped; {} people seen this run ({}).",
        seen.len(),
        ledger.backend_name()
    );
    Ok(())
}

fn print_event(event: &AttendanceEvent) {
    match &event.outcome {
        MarkOutcome::Marked { time } => println!("✔ {} marked present at {time}", event.identity),
        MarkOutcome::AlreadyMarked => println!("• {} is already marked today", event.identity),
        MarkOutcome::Failed(reason) => {
            eprintln!("✘ could not record attendance for {}: {reason}", event.identity)
        }
    }
}

// --- views ---

fn show(config: &Config, date: NaiveDate) -> Result<()> {
    let ledger = open_ledger(config)?;
    let records = ledger.records_on(date)?;
    let day = format_date(date);

    if records.is_empty() {
        println!("No attendance recorded for {day}.");
        return Ok(());
    }

    let width = records.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
    println!("Attendance for {day} ({})", ledger.backend_name());
    println!("{:>4}  {:<width$}  TIME", "#", "NAME");
    for (i, record) in records.iter().enumerate() {
        println!("{:>4}  {:<width$}  {}", i + 1, record.name, record.time_string());
    }
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let identities = store.identities()?;
    if identities.is_empty() {
        println!("No faces enrolled.");
        return Ok(());
    }
    for (identity, samples) in identities {
        println!("{identity}  ({samples} samples)");
    }
    Ok(())
}

#[derive(Serialize)]
struct Status {
    version: &'static str,
    camera_device: String,
    camera_present: bool,
    cascade_path: String,
    cascade_error: Option<String>,
    db_path: String,
    enrolled_identities: usize,
    enrolled_samples: usize,
    attendance_backend: String,
    marked_today: Option<usize>,
}

fn status(config: &Config) -> Result<()> {
    let cascade_error = load_locator(config).err().map(|e| format!("{e:#}"));
    let store = open_store(config)?;
    let today = Local::now().date_naive();
    let marked_today = open_ledger(config)
        .and_then(|ledger| Ok(ledger.records_on(today)?.len()))
        .map_err(|e| tracing::warn!(error = %e, "attendance backend unavailable"))
        .ok();

    let report = Status {
        version: env!("CARGO_PKG_VERSION"),
        camera_device: config.camera_device.clone(),
        camera_present: Path::new(&config.camera_device).exists(),
        cascade_path: config.cascade_path().display().to_string(),
        cascade_error,
        db_path: config.db_path.display().to_string(),
        enrolled_identities: store.identities()?.len(),
        enrolled_samples: store.sample_count()?,
        attendance_backend: config.attendance_backend.to_string(),
        marked_today,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// --- diagnostics ---

fn camera_test(config: &Config, frames: usize) -> Result<()> {
    println!("V4L2 capture devices:");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("  (none found)");
    }
    for dev in &devices {
        println!("  {}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
    }

    let locator = match load_locator(config) {
        Ok(locator) => Some(locator),
        Err(e) => {
            println!("Face cascade unavailable ({e:#}); skipping detection.");
            None
        }
    };

    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("opening {}", config.camera_device))?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut stream = camera.stream()?;
    for _ in 0..config.warmup_frames {
        let _ = stream.next_frame();
    }

    let mut dark = 0;
    for i in 0..frames {
        let Some(frame) = stream.next_frame()? else {
            break;
        };
        let faces = match (&locator, frame.is_dark) {
            (Some(locator), false) => locator.locate(&frame.image).len().to_string(),
            (_, true) => "-".to_string(),
            (None, false) => "?".to_string(),
        };
        if frame.is_dark {
            dark += 1;
        }
        println!(
            "  frame {:>3}: seq={} brightness={:>6.1} dark={} faces={faces}",
            i + 1,
            frame.sequence,
            frame.avg_brightness(),
            frame.is_dark
        );
    }
    println!("{dark}/{frames} frames were dark.");
    Ok(())
}
