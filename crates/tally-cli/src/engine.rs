use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_hw::{Camera, CameraError, DirectorySource, Frame, FrameSource};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
    #[error("capture thread exited")]
    ThreadExited,
}

/// Where frames come from.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    Camera {
        device: String,
        width: u32,
        height: u32,
        warmup_frames: usize,
    },
    /// Replay image files, pausing `pace` between frames.
    Directory { dir: PathBuf, pace: Duration },
}

/// Receives every non-dark frame on the capture thread.
pub trait FrameHandler: Send + 'static {
    fn on_frame(&mut self, frame: Frame) -> ControlFlow<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub delivered: usize,
    pub dark_skipped: usize,
}

/// Running capture thread.
pub struct CaptureHandle<H> {
    stop: Arc<AtomicBool>,
    thread: std::thread::JoinHandle<(H, Result<CaptureStats, EngineError>)>,
}

impl<H: Send + 'static> CaptureHandle<H> {
    /// Ask the thread to stop after the frame in hand.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether the thread has ended on its own (source exhausted or failed).
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stop the thread and wait for it, returning the handler.
    pub async fn join(self) -> Result<(H, CaptureStats), EngineError> {
        self.stop();
        let thread = self.thread;
        let (handler, result) = tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|_| EngineError::ThreadExited)?
            .map_err(|_| EngineError::ThreadExited)?;
        Ok((handler, result?))
    }
}

/// Spawn the capture loop on a dedicated OS thread.
///
/// The source is opened inside the thread; startup failures (missing or busy
/// camera, unreadable directory) are returned here before any frame flows.
/// Dark frames are dropped before reaching `handler`.
pub async fn spawn_capture<H: FrameHandler>(
    spec: SourceSpec,
    handler: H,
) -> Result<CaptureHandle<H>, EngineError> {
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();

    let thread_stop = stop.clone();
    let thread = std::thread::Builder::new()
        .name("tally-capture".into())
        .spawn(move || {
            let mut handler = handler;
            let result = run(spec, &thread_stop, &mut handler, ready_tx);
            (handler, result)
        })
        .map_err(EngineError::Spawn)?;

    ready_rx.await.map_err(|_| EngineError::ThreadExited)??;
    Ok(CaptureHandle { stop, thread })
}

fn run<H: FrameHandler>(
    spec: SourceSpec,
    stop: &AtomicBool,
    handler: &mut H,
    ready: oneshot::Sender<Result<(), EngineError>>,
) -> Result<CaptureStats, EngineError> {
    match spec {
        SourceSpec::Camera {
            device,
            width,
            height,
            warmup_frames,
        } => {
            let camera = match Camera::open(&device, width, height) {
                Ok(camera) => camera,
                Err(e) => {
                    let _ = ready.send(Err(e.into()));
                    return Ok(CaptureStats::default());
                }
            };
            tracing::info!(
                device = %device,
                width = camera.width,
                height = camera.height,
                fourcc = ?camera.fourcc,
                "camera opened"
            );
            let mut stream = match camera.stream() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready.send(Err(e.into()));
                    return Ok(CaptureStats::default());
                }
            };

            if warmup_frames > 0 {
                tracing::info!(count = warmup_frames, "discarding warmup frames");
                for _ in 0..warmup_frames {
                    let _ = stream.next_frame();
                }
            }

            let _ = ready.send(Ok(()));
            pump(&mut stream, stop, handler, Duration::ZERO)
        }
        SourceSpec::Directory { dir, pace } => {
            let mut source = match DirectorySource::open(&dir) {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready.send(Err(e.into()));
                    return Ok(CaptureStats::default());
                }
            };
            let _ = ready.send(Ok(()));
            pump(&mut source, stop, handler, pace)
        }
    }
}

fn pump<S: FrameSource, H: FrameHandler>(
    source: &mut S,
    stop: &AtomicBool,
    handler: &mut H,
    pace: Duration,
) -> Result<CaptureStats, EngineError> {
    tracing::info!("capture thread started");
    let mut stats = CaptureStats::default();

    while !stop.load(Ordering::SeqCst) {
        let Some(frame) = source.next_frame()? else {
            tracing::info!(delivered = stats.delivered, "frame source exhausted");
            break;
        };

        if frame.is_dark {
            stats.dark_skipped += 1;
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            continue;
        }

        stats.delivered += 1;
        if handler.on_frame(frame).is_break() {
            break;
        }

        if !pace.is_zero() {
            std::thread::sleep(pace);
        }
    }

    tracing::info!(
        delivered = stats.delivered,
        dark_skipped = stats.dark_skipped,
        "capture thread exiting"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    struct Counter {
        seen: Vec<u32>,
        limit: usize,
    }

    impl FrameHandler for Counter {
        fn on_frame(&mut self, frame: Frame) -> ControlFlow<()> {
            self.seen.push(frame.sequence);
            if self.seen.len() >= self.limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }

    fn frames_dir(count: usize, dark: &[usize]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..count {
            let value = if dark.contains(&i) { 0 } else { 150 };
            RgbImage::from_pixel(8, 8, Rgb([value, value, value]))
                .save(dir.path().join(format!("frame_{i:03}.png")))
                .unwrap();
        }
        dir
    }

    fn replay(dir: &tempfile::TempDir) -> SourceSpec {
        SourceSpec::Directory {
            dir: dir.path().to_path_buf(),
            pace: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_replay_skips_dark_frames() {
        let dir = frames_dir(4, &[1]);
        let handle = spawn_capture(replay(&dir), Counter { seen: vec![], limit: 100 })
            .await
            .unwrap();
        let (counter, stats) = handle.join().await.unwrap();
        assert_eq!(counter.seen, vec![0, 2, 3]);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.dark_skipped, 1);
    }

    #[tokio::test]
    async fn test_handler_break_stops_capture() {
        let dir = frames_dir(5, &[]);
        let handle = spawn_capture(replay(&dir), Counter { seen: vec![], limit: 2 })
            .await
            .unwrap();
        let (counter, _) = handle.join().await.unwrap();
        assert_eq!(counter.seen.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_fails_at_startup() {
        let spec = SourceSpec::Directory {
            dir: PathBuf::from("/nonexistent/frames"),
            pace: Duration::ZERO,
        };
        let result = spawn_capture(spec, Counter { seen: vec![], limit: 1 }).await;
        assert!(matches!(result, Err(EngineError::Camera(_))));
    }

    #[tokio::test]
    async fn test_missing_camera_fails_at_startup() {
        let spec = SourceSpec::Camera {
            device: "/dev/does-not-exist".into(),
            width: 640,
            height: 480,
            warmup_frames: 0,
        };
        let result = spawn_capture(spec, Counter { seen: vec![], limit: 1 }).await;
        assert!(matches!(result, Err(EngineError::Camera(CameraError::DeviceNotFound(_)))));
    }
}
