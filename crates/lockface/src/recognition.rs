//! Lock-triggered recognition.
//!
//! An outer thread polls the lock signal. While the session is locked an
//! inner thread alternates camera-on windows (frames go to the analyzer)
//! with camera-off windows. The first matching frame triggers one unlock
//! attempt, keeps a fresh photo of the user and ends the activation.
//!
//! All state changes go through [`StateCell`]'s transition operations; every
//! sleep is interruptible by a state change.

use crate::operator::Level;
use crate::services::{CameraGuard, Services};
use crate::session_lock::LockSignal;
use crate::slot::{SessionKind, SessionLease, SlotError};
use crate::unlock::{spawn_unlock, UnlockAttempt, Unlocker};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::GrayImage;
use lockface_core::{crop_face, frame_image};
use lockface_hw::Frame;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest a frame wait blocks before the window and state are rechecked.
const FRAME_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecognitionTiming {
    pub lock_poll: Duration,
    /// Delay between noticing the lock and turning the camera on.
    pub settle: Duration,
    pub camera_on: Duration,
    pub camera_off: Duration,
}

impl Default for RecognitionTiming {
    fn default() -> Self {
        Self {
            lock_poll: Duration::from_secs(10),
            settle: Duration::from_secs(5),
            camera_on: Duration::from_secs(5),
            camera_off: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionState {
    Inactive,
    PollingLockState,
    CameraWindowOn,
    CameraWindowOff,
    Stopping,
}

/// How an activation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    Matched { user: String, distance: f32 },
    CameraFailed(String),
    Stopped,
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("recognition is already active")]
    AlreadyActive,
    #[error("failed to spawn recognition thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Mutex-guarded state with compare-and-set transitions.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<RecognitionState>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(RecognitionState::Inactive),
            changed: Condvar::new(),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> RecognitionState {
        *self.state.lock()
    }

    fn transition(&self, from: &[RecognitionState], to: RecognitionState) -> bool {
        let mut state = self.state.lock();
        if !from.contains(&state) {
            return false;
        }
        tracing::debug!(from = ?*state, to = ?to, "recognition transition");
        *state = to;
        self.changed.notify_all();
        true
    }

    pub fn activate(&self) -> bool {
        self.transition(&[RecognitionState::Inactive], RecognitionState::PollingLockState)
    }

    pub fn begin_cycle(&self) -> bool {
        self.transition(&[RecognitionState::PollingLockState], RecognitionState::CameraWindowOn)
    }

    pub fn enter_window_off(&self) -> bool {
        self.transition(&[RecognitionState::CameraWindowOn], RecognitionState::CameraWindowOff)
    }

    pub fn resume_window_on(&self) -> bool {
        self.transition(&[RecognitionState::CameraWindowOff], RecognitionState::CameraWindowOn)
    }

    pub fn end_cycle(&self) -> bool {
        self.transition(
            &[RecognitionState::CameraWindowOn, RecognitionState::CameraWindowOff],
            RecognitionState::PollingLockState,
        )
    }

    /// Succeeds for exactly one caller per activation.
    pub fn request_stop(&self) -> bool {
        self.transition(
            &[
                RecognitionState::PollingLockState,
                RecognitionState::CameraWindowOn,
                RecognitionState::CameraWindowOff,
            ],
            RecognitionState::Stopping,
        )
    }

    pub fn finish(&self) -> bool {
        self.transition(&[RecognitionState::Stopping], RecognitionState::Inactive)
    }

    /// Sleep up to `duration` while the state stays `expected`.
    /// Returns `true` if the full duration elapsed with the state unchanged.
    fn hold(&self, expected: RecognitionState, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while *state == expected {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return *state == expected;
            }
        }
        false
    }

    /// Sleep until `deadline`, waking early only when the activation stops.
    fn hold_until_stopped(&self, deadline: Instant) {
        let mut state = self.state.lock();
        while !matches!(*state, RecognitionState::Stopping | RecognitionState::Inactive) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return;
            }
        }
    }
}

struct Inner {
    services: Services,
    lock: Arc<dyn LockSignal>,
    unlocker: Arc<dyn Unlocker>,
    timing: RecognitionTiming,
    max_photos: usize,
    state: StateCell,
    outcome: Mutex<Option<RecognitionOutcome>>,
    unlock: Mutex<Option<UnlockAttempt>>,
    /// Serialises "check state, open camera" against releasing the camera.
    camera_gate: Mutex<()>,
}

/// Handle to a running activation.
pub struct Activation {
    outcome: Receiver<RecognitionOutcome>,
}

impl Activation {
    /// Block until the activation ends, or `None` after `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<RecognitionOutcome> {
        self.outcome.recv_timeout(timeout).ok()
    }

    /// Block until the activation ends.
    pub fn join(&self) -> Option<RecognitionOutcome> {
        self.outcome.recv().ok()
    }
}

#[derive(Clone)]
pub struct RecognitionController {
    inner: Arc<Inner>,
}

impl RecognitionController {
    pub fn new(
        services: Services,
        lock: Arc<dyn LockSignal>,
        unlocker: Arc<dyn Unlocker>,
        timing: RecognitionTiming,
        max_photos: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                lock,
                unlocker,
                timing,
                max_photos,
                state: StateCell::default(),
                outcome: Mutex::new(None),
                unlock: Mutex::new(None),
                camera_gate: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> RecognitionState {
        self.inner.state.get()
    }

    /// Start polling the lock signal. The activation holds the session slot
    /// until it ends.
    pub fn activate(&self) -> Result<Activation, RecognitionError> {
        let lease = self.inner.services.slot.acquire(SessionKind::Recognition)?;
        if !self.inner.state.activate() {
            return Err(RecognitionError::AlreadyActive);
        }
        *self.inner.outcome.lock() = None;
        *self.inner.unlock.lock() = None;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("lockface-lock-poll".into())
            .spawn(move || {
                let outcome = inner.poll_loop(lease);
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            self.inner.state.request_stop();
            self.inner.state.finish();
            return Err(e.into());
        }

        tracing::info!("recognition activated");
        self.inner.services.operator.status("Recognition active; waiting for the session to lock");
        Ok(Activation { outcome: rx })
    }

    /// Deactivate. The camera is released before this returns and stays
    /// released for the rest of the activation.
    pub fn stop(&self) {
        if self.inner.state.request_stop() {
            tracing::info!("recognition stop requested");
        }
        self.inner.release_camera();
    }

    /// Wait up to `timeout` for the last activation's unlock attempt to
    /// finish. `true` when there was none.
    pub fn wait_for_unlock(&self, timeout: Duration) -> bool {
        match self.inner.unlock.lock().as_ref() {
            Some(attempt) => attempt.wait(timeout),
            None => true,
        }
    }
}

impl Inner {
    fn poll_loop(self: &Arc<Self>, lease: SessionLease) -> RecognitionOutcome {
        let mut cycle: Option<JoinHandle<()>> = None;

        loop {
            let state = self.state.get();
            if state == RecognitionState::Stopping {
                break;
            }
            let locked = self.lock.is_locked();
            let cycling = matches!(
                state,
                RecognitionState::CameraWindowOn | RecognitionState::CameraWindowOff
            );

            match (locked, cycling) {
                (true, false) => {
                    tracing::info!("session locked; starting recognition cycle");
                    self.services.operator.status("Session locked");
                    if !self.state.hold(RecognitionState::PollingLockState, self.timing.settle) {
                        continue;
                    }
                    join_cycle(cycle.take());
                    if self.state.begin_cycle() {
                        cycle = self.spawn_cycle();
                    }
                }
                (false, true) => {
                    tracing::info!("session unlocked; stopping recognition cycle");
                    self.state.end_cycle();
                    self.release_camera();
                    join_cycle(cycle.take());
                    self.services.operator.greet(None);
                    self.services.operator.status("Session unlocked");
                }
                _ => tracing::trace!(locked, ?state, "lock state unchanged"),
            }

            if self.state.get() == RecognitionState::Stopping {
                break;
            }
            // Window flips must not shorten the poll interval.
            self.state.hold_until_stopped(Instant::now() + self.timing.lock_poll);
        }

        self.release_camera();
        join_cycle(cycle.take());
        self.release_camera();
        self.state.finish();
        drop(lease);

        let outcome = self.outcome.lock().take().unwrap_or(RecognitionOutcome::Stopped);
        tracing::info!(?outcome, "recognition deactivated");
        outcome
    }

    fn spawn_cycle(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let inner = Arc::clone(self);
        match std::thread::Builder::new()
            .name("lockface-cycle".into())
            .spawn(move || inner.cycle_loop())
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.fail(format!("could not start recognition cycle: {e}"));
                None
            }
        }
    }

    fn cycle_loop(&self) {
        loop {
            if self.state.get() != RecognitionState::CameraWindowOn {
                return;
            }
            self.camera_window();

            if !self.state.enter_window_off() {
                return;
            }
            tracing::debug!("camera window off");
            if !self.state.hold(RecognitionState::CameraWindowOff, self.timing.camera_off) {
                return;
            }
            if !self.state.resume_window_on() {
                return;
            }
        }
    }

    /// One camera-on window: feed frames to the analyzer until the window
    /// closes, the state changes, or a face matches.
    fn camera_window(&self) {
        let camera = &self.services.camera;
        let started = {
            let _gate = self.camera_gate.lock();
            if self.state.get() != RecognitionState::CameraWindowOn {
                return;
            }
            camera.start()
        };
        let frames = match started {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(format!("camera failed to start: {e}"));
                return;
            }
        };
        let _camera = CameraGuard(camera);
        tracing::debug!("camera window on");

        let deadline = Instant::now() + self.timing.camera_on;
        while self.state.get() == RecognitionState::CameraWindowOn {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match frames.recv_timeout(remaining.min(FRAME_WAIT)) {
                Ok(frame) => {
                    if self.state.get() != RecognitionState::CameraWindowOn {
                        break;
                    }
                    if self.handle_frame(frame) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.fail("camera stopped delivering frames".into());
                    break;
                }
            }
        }
    }

    /// Returns `true` when the frame produced the activation's match.
    fn handle_frame(&self, frame: Frame) -> bool {
        let image = match frame_image(frame.data, frame.width, frame.height) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return false;
            }
        };
        let analysis = match self.services.analyzer.lock().process(&image) {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(error = %e, "frame analysis failed");
                return false;
            }
        };
        self.services.operator.preview(&analysis.annotated);

        let Some(found) = analysis.matches.into_iter().next() else {
            self.services.operator.greet(None);
            return false;
        };
        // Only the first match of an activation gets past this point.
        if !self.state.request_stop() {
            return false;
        }

        tracing::info!(
            target: "lockface::auth",
            user = %found.identity,
            distance = found.distance,
            "face matched"
        );
        let attempt = spawn_unlock(Arc::clone(&self.unlocker), found.identity.clone());
        *self.unlock.lock() = Some(attempt);
        self.services.operator.greet(Some(&found.identity));
        self.keep_photo(&image, &found.identity);

        *self.outcome.lock() = Some(RecognitionOutcome::Matched {
            user: found.identity,
            distance: found.distance,
        });
        true
    }

    /// Store a fresh single-face crop of `user` and retrain in the background.
    fn keep_photo(&self, image: &GrayImage, user: &str) {
        let store = &self.services.store;
        match store.count(user) {
            Ok(count) if count < self.max_photos => {}
            Ok(count) => {
                tracing::debug!(user, count, "photo ceiling reached; not keeping match photo");
                return;
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "could not count photos");
                return;
            }
        }

        let faces = match self.services.analyzer.lock().detect(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "re-detection failed");
                return;
            }
        };
        let [face] = faces.as_slice() else {
            tracing::debug!(faces = faces.len(), "match photo skipped: need exactly one face");
            return;
        };
        let Some(crop) = crop_face(image, face) else {
            return;
        };

        match store.add_and_retain(user, &crop) {
            Ok(report) => {
                tracing::info!(
                    user,
                    aged_out = report.aged_out,
                    trimmed = report.trimmed,
                    remaining = report.remaining,
                    "match photo kept"
                );
                self.services.training.request(None);
            }
            Err(e) => tracing::error!(user, error = %e, "failed to keep match photo"),
        }
    }

    fn release_camera(&self) {
        let _gate = self.camera_gate.lock();
        self.services.camera.stop();
    }

    /// Fatal for this activation: report and deactivate.
    fn fail(&self, message: String) {
        tracing::error!(error = %message, "recognition session failed");
        self.services.operator.notify(Level::Error, "Recognition", &message);
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(RecognitionOutcome::CameraFailed(message));
        }
        drop(outcome);
        self.state.request_stop();
    }
}

fn join_cycle(cycle: Option<JoinHandle<()>>) {
    if let Some(handle) = cycle {
        if handle.join().is_err() {
            tracing::error!("recognition cycle thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FaceScript, Harness};
    use lockface_store::PhotoStore;

    fn fast_timing() -> RecognitionTiming {
        RecognitionTiming {
            lock_poll: Duration::from_millis(20),
            settle: Duration::from_millis(10),
            camera_on: Duration::from_millis(200),
            camera_off: Duration::from_millis(50),
        }
    }

    fn controller(h: &Harness, max_photos: usize) -> RecognitionController {
        RecognitionController::new(h.services(), h.lock.clone(), h.unlocker.clone(), fast_timing(), max_photos)
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::default();
        assert!(!cell.begin_cycle());
        assert!(cell.activate());
        assert!(!cell.activate());
        assert!(cell.begin_cycle());
        assert!(cell.enter_window_off());
        assert!(cell.resume_window_on());
        assert!(cell.end_cycle());
        assert_eq!(cell.get(), RecognitionState::PollingLockState);
        assert!(cell.request_stop());
        assert!(!cell.request_stop());
        assert!(!cell.end_cycle());
        assert!(cell.finish());
        assert_eq!(cell.get(), RecognitionState::Inactive);
    }

    #[test]
    fn test_hold_wakes_on_transition() {
        let cell = Arc::new(StateCell::default());
        cell.activate();
        let waker = Arc::clone(&cell);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.request_stop();
        });
        let started = Instant::now();
        assert!(!cell.hold(RecognitionState::PollingLockState, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        t.join().unwrap();
        assert!(cell.hold(RecognitionState::Stopping, Duration::from_millis(5)));
    }

    #[test]
    fn test_match_unlocks_once_and_deactivates() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.recognize_as(Some("alice"));
        h.lock.set(true);
        let rec = controller(&h, 100);

        let activation = rec.activate().unwrap();
        let outcome = activation.wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, RecognitionOutcome::Matched { ref user, .. } if user == "alice"));
        assert_eq!(rec.state(), RecognitionState::Inactive);
        assert!(!h.camera.is_active());
        assert_eq!(h.slot.active(), None);

        // No frame reaches the analyzer once the match has ended the activation.
        let analyzed = h.analyzer_calls();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(h.analyzer_calls(), analyzed);

        assert!(wait_until(Duration::from_secs(2), || h.unlocker.calls().len() == 1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(h.unlocker.calls(), vec!["alice".to_string()]);
        assert_eq!(h.operator.greetings().last().cloned().flatten().as_deref(), Some("alice"));

        // Match photo stored through the retention path, then retrained.
        assert_eq!(h.store.count("alice").unwrap(), 1);
        assert!(h.training.wait_idle(Duration::from_secs(2)));
        assert_eq!(h.trainer.runs(), 1);
    }

    #[test]
    fn test_match_at_ceiling_keeps_no_photo() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.seed_photos("alice", 3);
        h.recognize_as(Some("alice"));
        h.lock.set(true);
        let rec = controller(&h, 3);

        let outcome = rec.activate().unwrap().wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, RecognitionOutcome::Matched { .. }));
        assert_eq!(h.store.count("alice").unwrap(), 3);
        assert!(wait_until(Duration::from_secs(2), || h.unlocker.calls().len() == 1));
        assert_eq!(h.trainer.runs(), 0);
    }

    #[test]
    fn test_unlocked_session_never_opens_camera() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.recognize_as(Some("alice"));
        let rec = controller(&h, 100);

        let activation = rec.activate().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(h.opener.opens(), 0);
        rec.stop();
        assert_eq!(activation.wait(Duration::from_secs(2)), Some(RecognitionOutcome::Stopped));
        assert!(h.unlocker.calls().is_empty());
    }

    #[test]
    fn test_no_match_keeps_cycling_until_unlock() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.recognize_as(None);
        h.lock.set(true);
        let rec = controller(&h, 100);

        let activation = rec.activate().unwrap();
        // At least two camera-on windows.
        assert!(wait_until(Duration::from_secs(3), || h.opener.opens() >= 2));
        h.lock.set(false);
        assert!(wait_until(Duration::from_secs(2), || {
            rec.state() == RecognitionState::PollingLockState && !h.camera.is_active()
        }));

        rec.stop();
        assert_eq!(activation.wait(Duration::from_secs(2)), Some(RecognitionOutcome::Stopped));
        assert!(h.unlocker.calls().is_empty());
        assert!(h.operator.greetings().iter().all(Option::is_none));
    }

    #[test]
    fn test_camera_failure_deactivates() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.opener.fail_all();
        h.lock.set(true);
        let rec = controller(&h, 100);

        let outcome = rec.activate().unwrap().wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, RecognitionOutcome::CameraFailed(_)));
        assert_eq!(rec.state(), RecognitionState::Inactive);
        assert!(h.operator.notices().iter().any(|(level, _)| *level == Level::Error));
        assert!(h.unlocker.calls().is_empty());
    }

    #[test]
    fn test_activation_requires_free_slot() {
        let h = Harness::new(FaceScript::AlwaysOne);
        let _held = h.slot.acquire(SessionKind::Registration).unwrap();
        let rec = controller(&h, 100);
        assert!(matches!(
            rec.activate(),
            Err(RecognitionError::Slot(SlotError::Busy(SessionKind::Registration)))
        ));
        assert_eq!(rec.state(), RecognitionState::Inactive);
    }

    #[test]
    fn test_lock_polled_at_configured_interval_while_cycling() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.recognize_as(None);
        h.lock.set(true);
        let timing = RecognitionTiming {
            lock_poll: Duration::from_secs(2),
            settle: Duration::from_millis(10),
            camera_on: Duration::from_millis(50),
            camera_off: Duration::from_millis(50),
        };
        let rec = RecognitionController::new(h.services(), h.lock.clone(), h.unlocker.clone(), timing, 100);

        let activation = rec.activate().unwrap();
        std::thread::sleep(Duration::from_secs(1));
        // Several windows have flipped, but only the first poll has run.
        assert!(h.opener.opens() >= 2);
        assert!(h.lock.polls() <= 2, "polled {} times", h.lock.polls());

        rec.stop();
        assert_eq!(activation.wait(Duration::from_secs(2)), Some(RecognitionOutcome::Stopped));
    }

    #[test]
    fn test_unlock_attempt_outlives_activation_until_waited() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.seed_photos("alice", 1);
        h.recognize_as(Some("alice"));
        h.unlocker.set_delay(Duration::from_millis(200));
        h.lock.set(true);
        // At the photo ceiling: no retrain keeps anything else alive.
        let rec = controller(&h, 1);

        let outcome = rec.activate().unwrap().wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, RecognitionOutcome::Matched { .. }));
        assert!(rec.wait_for_unlock(Duration::from_secs(2)));
        assert_eq!(h.unlocker.calls(), vec!["alice".to_string()]);
        assert_eq!(h.trainer.runs(), 0);
    }

    #[test]
    fn test_wait_for_unlock_without_match() {
        let h = Harness::new(FaceScript::AlwaysOne);
        let rec = controller(&h, 100);
        assert!(rec.wait_for_unlock(Duration::ZERO));
    }

    #[test]
    fn test_stop_keeps_camera_released() {
        let h = Harness::new(FaceScript::AlwaysOne);
        h.recognize_as(None);
        h.lock.set(true);
        let rec = controller(&h, 100);

        for i in 0..15u64 {
            let activation = rec.activate().unwrap();
            std::thread::sleep(Duration::from_millis(i * 3));
            rec.stop();
            assert!(!h.camera.is_active());
            let opens = h.opener.opens();
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(h.opener.opens(), opens, "camera reopened after stop");
            assert!(!h.camera.is_active());
            assert_eq!(activation.wait(Duration::from_secs(2)), Some(RecognitionOutcome::Stopped));
        }
    }
}
