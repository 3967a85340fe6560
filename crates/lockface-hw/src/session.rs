//! Background capture session.
//!
//! A [`CaptureSession`] owns the camera singleton. `start` opens the device
//! and spawns the acquisition thread; frames travel through a single-slot
//! channel where the newest frame always replaces an unread one. `stop`
//! flips the session inactive and releases the device before returning.
//!
//! Read failures are retried in place. After `max_read_failures` in a row
//! the device is reopened; if that fails the session deactivates itself and
//! the frame channel disconnects.

use crate::camera::CameraError;
use crate::frame::Frame;
use crate::source::{FrameSource, SourceOpener};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Consumer end of the latest-frame channel.
pub type FrameReceiver = Receiver<Frame>;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera {device} unavailable after {attempts} attempts: {source}")]
    OpenFailed {
        device: String,
        attempts: u32,
        #[source]
        source: CameraError,
    },
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Retry and timeout knobs for a capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Consecutive read failures tolerated before the device is reopened.
    pub max_read_failures: u32,
    /// Pause after a failed read.
    pub read_retry_delay: Duration,
    /// Attempts made when opening (or reopening) the device.
    pub open_attempts: u32,
    /// Pause between open attempts.
    pub open_retry_delay: Duration,
    /// Frames read right after opening; at least one must succeed.
    pub probe_frames: u32,
    /// How long `stop` waits for the acquisition thread to exit.
    pub join_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_read_failures: 5,
            read_retry_delay: Duration::from_millis(100),
            open_attempts: 3,
            open_retry_delay: Duration::from_millis(500),
            probe_frames: 3,
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// State shared between the session handle and its acquisition thread.
struct Shared {
    active: AtomicBool,
    device: Mutex<Option<Box<dyn FrameSource>>>,
}

impl Shared {
    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        drop(self.device.lock().take());
    }
}

struct Running {
    shared: Arc<Shared>,
    frames: Receiver<Frame>,
    thread: Option<JoinHandle<()>>,
    /// Disconnects when the acquisition thread exits.
    exited: Receiver<()>,
}

impl Running {
    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let exited = matches!(
            self.exited.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected) | Ok(())
        );
        if exited {
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    tracing::error!("capture thread panicked");
                }
            }
        }
        exited
    }
}

/// Exclusive owner of the camera device.
pub struct CaptureSession {
    opener: Arc<dyn SourceOpener>,
    config: CaptureConfig,
    running: Mutex<Option<Running>>,
}

impl CaptureSession {
    pub fn new(opener: Arc<dyn SourceOpener>, config: CaptureConfig) -> Self {
        Self {
            opener,
            config,
            running: Mutex::new(None),
        }
    }

    /// Start capturing, or join the capture already in progress.
    ///
    /// Starting an active session is a successful no-op that hands back
    /// another receiver for the same stream; it never spawns a second thread.
    pub fn start(&self) -> Result<FrameReceiver, CaptureError> {
        let mut running = self.running.lock();

        if let Some(run) = running.as_ref() {
            if run.shared.active.load(Ordering::Acquire) {
                tracing::debug!("capture already active");
                return Ok(run.frames.clone());
            }
        }
        if let Some(mut stale) = running.take() {
            if !stale.wait_exit(self.config.join_timeout) {
                tracing::warn!("previous capture thread still running; starting a new one anyway");
            }
        }

        let source = open_source(self.opener.as_ref(), &self.config)?;
        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            device: Mutex::new(Some(source)),
        });
        let (tx, rx) = crossbeam_channel::bounded::<Frame>(1);
        let (exit_tx, exit_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = {
            let shared = Arc::clone(&shared);
            let opener = Arc::clone(&self.opener);
            let config = self.config.clone();
            let drain = rx.clone();
            std::thread::Builder::new()
                .name("lockface-capture".into())
                .spawn(move || {
                    capture_loop(&shared, opener.as_ref(), &config, &tx, &drain);
                    drop(exit_tx);
                })
        };
        let thread = match thread {
            Ok(handle) => handle,
            Err(e) => {
                shared.deactivate();
                return Err(CaptureError::Spawn(e));
            }
        };

        tracing::info!(device = %self.opener.describe(), "capture started");
        *running = Some(Running {
            shared,
            frames: rx.clone(),
            thread: Some(thread),
            exited: exit_rx,
        });
        Ok(rx)
    }

    /// Stop capturing. The device is released before this returns; the
    /// acquisition thread is given `join_timeout` to wind down.
    pub fn stop(&self) {
        let mut running = self.running.lock();
        let Some(run) = running.as_mut() else {
            return;
        };
        if run.shared.active.load(Ordering::Acquire) {
            tracing::info!("stopping capture");
        }
        run.shared.deactivate();

        if run.wait_exit(self.config.join_timeout) {
            *running = None;
            tracing::debug!("capture thread exited");
        } else {
            tracing::warn!(timeout = ?self.config.join_timeout, "capture thread did not exit in time");
        }
    }

    /// Stop and wait up to `timeout` for the acquisition thread.
    /// Returns `false` if the thread is still alive afterwards.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        let mut running = self.running.lock();
        match running.as_mut() {
            None => true,
            Some(run) => {
                let exited = run.wait_exit(timeout);
                if exited {
                    *running = None;
                }
                exited
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|run| run.shared.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open a source and confirm it actually produces frames.
fn open_source(opener: &dyn SourceOpener, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    let attempts = config.open_attempts.max(1);
    let mut last_error = CameraError::CaptureFailed("no open attempt made".into());

    for attempt in 1..=attempts {
        match opener.open() {
            Ok(mut source) => {
                let good = (0..config.probe_frames.max(1))
                    .filter(|_| source.read_frame().is_ok())
                    .count();
                if good > 0 {
                    tracing::debug!(attempt, probe_ok = good, "camera opened");
                    return Ok(source);
                }
                tracing::warn!(attempt, "camera opened but produced no frames");
                last_error = CameraError::CaptureFailed("no frames during probe".into());
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "camera open failed");
                last_error = e;
            }
        }
        if attempt < attempts {
            std::thread::sleep(config.open_retry_delay);
        }
    }

    tracing::error!(device = %opener.describe(), attempts, "could not open camera");
    Err(CaptureError::OpenFailed {
        device: opener.describe(),
        attempts,
        source: last_error,
    })
}

/// Hand `frame` to the consumer, evicting an unread older frame if needed.
fn deliver(tx: &Sender<Frame>, drain: &Receiver<Frame>, frame: Frame) {
    match tx.try_send(frame) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(frame)) => {
            let _ = drain.try_recv();
            let _ = tx.try_send(frame);
        }
    }
}

fn capture_loop(
    shared: &Shared,
    opener: &dyn SourceOpener,
    config: &CaptureConfig,
    tx: &Sender<Frame>,
    drain: &Receiver<Frame>,
) {
    tracing::debug!("capture loop started");
    let mut failures = 0u32;

    while shared.active.load(Ordering::Acquire) {
        let read = {
            let mut device = shared.device.lock();
            match device.as_mut() {
                Some(source) => source.read_frame(),
                None => break,
            }
        };

        match read {
            Ok(frame) => {
                failures = 0;
                tracing::trace!(seq = frame.sequence, "frame captured");
                deliver(tx, drain, frame);
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, max = config.max_read_failures, "frame read failed");
                if failures >= config.max_read_failures {
                    tracing::error!("too many consecutive read failures; reinitialising camera");
                    if !reinitialise(shared, opener, config) {
                        break;
                    }
                    failures = 0;
                }
                std::thread::sleep(config.read_retry_delay);
            }
        }
    }

    tracing::info!("capture loop stopped");
}

/// Close and reopen the device. On failure the session is deactivated.
fn reinitialise(shared: &Shared, opener: &dyn SourceOpener, config: &CaptureConfig) -> bool {
    drop(shared.device.lock().take());
    if !shared.active.load(Ordering::Acquire) {
        return false;
    }

    match open_source(opener, config) {
        Ok(source) => {
            let mut device = shared.device.lock();
            if !shared.active.load(Ordering::Acquire) {
                return false;
            }
            *device = Some(source);
            tracing::info!("camera reinitialised");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "camera reinitialisation failed; deactivating capture");
            shared.deactivate();
            false
        }
    }
}
