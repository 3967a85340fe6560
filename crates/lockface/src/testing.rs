//! Fakes for controller tests: no camera, models or D-Bus required.

use crate::operator::{Level, Operator};
use crate::services::{Services, SharedAnalyzer};
use crate::session_lock::LockSignal;
use crate::slot::SessionSlot;
use crate::training::TrainingWorker;
use crate::unlock::{UnlockError, Unlocker};
use image::GrayImage;
use lockface_core::{AnalyzerError, BoundingBox, FaceAnalyzer, Identification, TrainError, Trainer};
use lockface_hw::{CameraError, CaptureConfig, CaptureSession, Frame, FrameSource, SourceOpener};
use lockface_store::{FsStore, PhotoStore, RetentionPolicy, UserRegistry};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const FRAME_SIZE: u32 = 64;

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

struct FakeSource {
    sequence: Arc<AtomicU32>,
}

impl FrameSource for FakeSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        std::thread::sleep(Duration::from_millis(2));
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(Frame::new(vec![90; (FRAME_SIZE * FRAME_SIZE) as usize], FRAME_SIZE, FRAME_SIZE, seq))
    }
}

#[derive(Default)]
pub struct FakeOpener {
    opens: AtomicUsize,
    fail: AtomicBool,
    sequence: Arc<AtomicU32>,
}

impl FakeOpener {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CameraError::DeviceNotFound("fake".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            sequence: Arc::clone(&self.sequence),
        }))
    }

    fn describe(&self) -> String {
        "fake camera".into()
    }
}

/// Face counts the scripted analyzer reports per `detect` call.
#[derive(Debug, Clone)]
pub enum FaceScript {
    AlwaysOne,
    Cycle(Vec<usize>),
}

pub struct ScriptedAnalyzer {
    script: FaceScript,
    calls: Arc<AtomicUsize>,
    identity: Arc<Mutex<Option<String>>>,
}

impl FaceAnalyzer for ScriptedAnalyzer {
    fn detect(&mut self, _frame: &GrayImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let n = match &self.script {
            FaceScript::AlwaysOne => 1,
            FaceScript::Cycle(counts) => counts[call % counts.len()],
        };
        Ok((0..n)
            .map(|i| BoundingBox {
                x: (i * 20) as f32,
                y: 4.0,
                width: 16.0,
                height: 16.0,
                confidence: 0.9,
            })
            .collect())
    }

    fn identify(&mut self, _face: &GrayImage) -> Result<Identification, AnalyzerError> {
        Ok(match self.identity.lock().clone() {
            Some(name) => Identification {
                identity: Some(name),
                distance: 0.2,
            },
            None => Identification::unknown(0.9),
        })
    }
}

#[derive(Default)]
pub struct CountingTrainer {
    runs: AtomicUsize,
    no_images: AtomicBool,
}

impl CountingTrainer {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn fail_with_no_images(&self) {
        self.no_images.store(true, Ordering::SeqCst);
    }
}

impl Trainer for CountingTrainer {
    fn train(&self) -> Result<f32, TrainError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.no_images.load(Ordering::SeqCst) {
            return Err(TrainError::NoTrainingImages);
        }
        Ok(0.9)
    }
}

#[derive(Default)]
pub struct RecordingOperator {
    answers: Mutex<VecDeque<bool>>,
    questions: Mutex<Vec<String>>,
    statuses: Mutex<Vec<String>>,
    notices: Mutex<Vec<(Level, String)>>,
    greetings: Mutex<Vec<Option<String>>>,
}

impl RecordingOperator {
    /// Queue the answer to the next question. Unqueued questions get "no".
    pub fn answer(&self, yes: bool) {
        self.answers.lock().push_back(yes);
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    pub fn notices(&self) -> Vec<(Level, String)> {
        self.notices.lock().clone()
    }

    pub fn greetings(&self) -> Vec<Option<String>> {
        self.greetings.lock().clone()
    }
}

impl Operator for RecordingOperator {
    fn status(&self, message: &str) {
        self.statuses.lock().push(message.to_string());
    }

    fn notify(&self, level: Level, title: &str, message: &str) {
        self.notices.lock().push((level, format!("{title}: {message}")));
    }

    fn confirm(&self, _title: &str, question: &str) -> bool {
        self.questions.lock().push(question.to_string());
        self.answers.lock().pop_front().unwrap_or(false)
    }

    fn progress(&self, _user: &str, _count: usize, _target: usize, _ceiling: usize) {}

    fn greet(&self, name: Option<&str>) {
        self.greetings.lock().push(name.map(str::to_string));
    }
}

#[derive(Default)]
pub struct FakeLock {
    locked: AtomicBool,
    polls: AtomicUsize,
}

impl FakeLock {
    pub fn set(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl LockSignal for FakeLock {
    fn is_locked(&self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.locked.load(Ordering::SeqCst)
    }
}

/// Records each unlock once it completes, after an optional delay.
#[derive(Default)]
pub struct RecordingUnlocker {
    calls: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
}

impl RecordingUnlocker {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

impl Unlocker for RecordingUnlocker {
    fn unlock(&self, user: &str) -> Result<(), UnlockError> {
        let delay = *self.delay.lock();
        std::thread::sleep(delay);
        self.calls.lock().push(user.to_string());
        Ok(())
    }
}

/// A full set of collaborators over a temporary photo store.
pub struct Harness {
    _dir: TempDir,
    pub store: Arc<FsStore>,
    pub opener: Arc<FakeOpener>,
    pub camera: Arc<CaptureSession>,
    pub analyzer: SharedAnalyzer,
    analyzer_calls: Arc<AtomicUsize>,
    identity: Arc<Mutex<Option<String>>>,
    pub trainer: Arc<CountingTrainer>,
    pub training: TrainingWorker,
    pub operator: Arc<RecordingOperator>,
    pub slot: Arc<SessionSlot>,
    pub lock: Arc<FakeLock>,
    pub unlocker: Arc<RecordingUnlocker>,
}

impl Harness {
    pub fn new(script: FaceScript) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsStore::open(dir.path().join("users"), RetentionPolicy::default()).unwrap());
        let opener = Arc::new(FakeOpener::default());
        let camera = Arc::new(CaptureSession::new(
            opener.clone(),
            CaptureConfig {
                open_attempts: 2,
                open_retry_delay: Duration::from_millis(1),
                read_retry_delay: Duration::from_millis(1),
                ..CaptureConfig::default()
            },
        ));
        let identity = Arc::new(Mutex::new(None));
        let analyzer_calls = Arc::new(AtomicUsize::new(0));
        let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(ScriptedAnalyzer {
            script,
            calls: Arc::clone(&analyzer_calls),
            identity: Arc::clone(&identity),
        })));
        let trainer = Arc::new(CountingTrainer::default());
        let training = TrainingWorker::new(trainer.clone());

        Self {
            _dir: dir,
            store,
            opener,
            camera,
            analyzer,
            analyzer_calls,
            identity,
            trainer,
            training,
            operator: Arc::new(RecordingOperator::default()),
            slot: SessionSlot::new(),
            lock: Arc::new(FakeLock::default()),
            unlocker: Arc::new(RecordingUnlocker::default()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            store: self.store.clone(),
            registry: self.store.clone(),
            camera: self.camera.clone(),
            analyzer: self.analyzer.clone(),
            training: self.training.clone(),
            operator: self.operator.clone(),
            slot: self.slot.clone(),
        }
    }

    /// Number of `detect` calls the analyzer has served.
    pub fn analyzer_calls(&self) -> usize {
        self.analyzer_calls.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &dyn UserRegistry {
        self.store.as_ref()
    }

    /// Identity every face is recognised as; `None` recognises nobody.
    pub fn recognize_as(&self, name: Option<&str>) {
        *self.identity.lock() = name.map(str::to_string);
    }

    pub fn seed_photos(&self, user: &str, n: usize) {
        UserRegistry::create(self.store.as_ref(), user).unwrap();
        for _ in 0..n {
            self.store.add(user, &GrayImage::new(128, 128)).unwrap();
        }
    }
}
