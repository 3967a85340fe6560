//! Enrollment: capture face photos toward a per-session target, then train.
//!
//! [`RegistrationMachine`] is the pure transition function; it never touches
//! the camera, the store or the operator. [`RegistrationController`] performs
//! the actions the machine asks for and feeds the results back as events.
//! Continuing after training is a `Resume` event carrying the fresh photo
//! count, not a nested call.

use crate::operator::Level;
use crate::services::{CameraGuard, Services};
use crate::slot::{SessionKind, SlotError};
use crate::training::TrainingEvent;
use crossbeam_channel::RecvTimeoutError;
use lockface_core::{crop_face, frame_image};
use lockface_hw::CaptureError;
use lockface_store::registry::validate_name;
use lockface_store::StoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const FRAME_WAIT: Duration = Duration::from_millis(200);

/// Photo-count constants that shape every registration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoLimits {
    /// Target for a user's first session.
    pub initial: usize,
    /// Photos added by each follow-up session.
    pub step: usize,
    /// Hard ceiling per user.
    pub max: usize,
}

impl Default for PhotoLimits {
    fn default() -> Self {
        Self {
            initial: 50,
            step: 5,
            max: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Idle,
    /// Waiting for the operator to decide whether to capture more.
    AwaitingTarget {
        user: String,
        count: usize,
        after_training: bool,
    },
    Capturing {
        user: String,
        target: usize,
    },
    TrainingPending {
        user: String,
        /// Target of the capture session that preceded training, if any.
        session_target: Option<usize>,
        count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    Start { user: String, existing: usize, known: bool },
    /// Operator chose to continue; `count` is the user's current photo count.
    Resume { count: usize },
    Decline,
    CaptureComplete { count: usize },
    TrainingDone,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationAction {
    Prompt { user: String, count: usize },
    Capture { user: String, target: usize, create_identity: bool },
    Train { user: String },
    Finish(RegistrationOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Completed { user: String, photos: usize },
    Cancelled { user: Option<String> },
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("event {event} not valid in state {state}")]
pub struct InvalidTransition {
    pub state: String,
    pub event: String,
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("camera: {0}")]
    Camera(#[from] CaptureError),
    #[error("camera stopped delivering frames")]
    CameraLost,
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// The registration state machine.
#[derive(Debug)]
pub struct RegistrationMachine {
    state: RegistrationState,
    limits: PhotoLimits,
}

impl RegistrationMachine {
    pub fn new(limits: PhotoLimits) -> Self {
        Self {
            state: RegistrationState::Idle,
            limits,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    /// Apply `event`. Invalid events leave the state untouched.
    pub fn handle(&mut self, event: RegistrationEvent) -> Result<RegistrationAction, InvalidTransition> {
        use RegistrationAction as A;
        use RegistrationEvent as E;
        use RegistrationState as S;

        let limits = self.limits;
        let (next, action) = match (&self.state, event) {
            (_, E::Cancel) => {
                let user = self.user().map(str::to_string);
                (S::Idle, A::Finish(RegistrationOutcome::Cancelled { user }))
            }

            (S::Idle, E::Start { user, existing: 0, known }) => (
                S::Capturing {
                    user: user.clone(),
                    target: limits.initial,
                },
                A::Capture {
                    user,
                    target: limits.initial,
                    create_identity: !known,
                },
            ),
            (S::Idle, E::Start { user, existing, .. }) => (
                S::AwaitingTarget {
                    user: user.clone(),
                    count: existing,
                    after_training: false,
                },
                A::Prompt { user, count: existing },
            ),

            (S::AwaitingTarget { user, .. }, E::Resume { count }) => {
                let target = (count + limits.step).min(limits.max);
                if target <= count {
                    (
                        S::TrainingPending {
                            user: user.clone(),
                            session_target: None,
                            count,
                        },
                        A::Train { user: user.clone() },
                    )
                } else {
                    (
                        S::Capturing {
                            user: user.clone(),
                            target,
                        },
                        A::Capture {
                            user: user.clone(),
                            target,
                            create_identity: false,
                        },
                    )
                }
            }
            (S::AwaitingTarget { user, count, after_training }, E::Decline) => {
                if *after_training {
                    (
                        S::Idle,
                        A::Finish(RegistrationOutcome::Completed {
                            user: user.clone(),
                            photos: *count,
                        }),
                    )
                } else {
                    (
                        S::TrainingPending {
                            user: user.clone(),
                            session_target: None,
                            count: *count,
                        },
                        A::Train { user: user.clone() },
                    )
                }
            }

            (S::Capturing { user, target }, E::CaptureComplete { count }) => (
                S::TrainingPending {
                    user: user.clone(),
                    session_target: Some(*target),
                    count,
                },
                A::Train { user: user.clone() },
            ),

            (S::TrainingPending { user, session_target, count }, E::TrainingDone) => {
                let offer_more =
                    *session_target == Some(limits.initial) && *count >= limits.initial && *count < limits.max;
                if offer_more {
                    (
                        S::AwaitingTarget {
                            user: user.clone(),
                            count: *count,
                            after_training: true,
                        },
                        A::Prompt {
                            user: user.clone(),
                            count: *count,
                        },
                    )
                } else {
                    (
                        S::Idle,
                        A::Finish(RegistrationOutcome::Completed {
                            user: user.clone(),
                            photos: *count,
                        }),
                    )
                }
            }

            (state, event) => {
                return Err(InvalidTransition {
                    state: format!("{state:?}"),
                    event: format!("{event:?}"),
                })
            }
        };

        tracing::debug!(from = ?self.state, to = ?next, "registration transition");
        self.state = next;
        Ok(action)
    }

    fn user(&self) -> Option<&str> {
        match &self.state {
            RegistrationState::Idle => None,
            RegistrationState::AwaitingTarget { user, .. }
            | RegistrationState::Capturing { user, .. }
            | RegistrationState::TrainingPending { user, .. } => Some(user),
        }
    }
}

/// Runs one registration flow at a time, holding the session slot for its
/// whole duration.
pub struct RegistrationController {
    services: Services,
    limits: PhotoLimits,
    cancelled: Arc<AtomicBool>,
}

impl RegistrationController {
    pub fn new(services: Services, limits: PhotoLimits) -> Self {
        Self {
            services,
            limits,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that aborts the running flow at the next frame or prompt.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn run(&self, user: &str) -> Result<RegistrationOutcome, RegistrationError> {
        validate_name(user)?;
        let _lease = self.services.slot.acquire(SessionKind::Registration)?;
        self.cancelled.store(false, Ordering::Release);

        let existing = self.services.store.count(user)?;
        let known = self.services.registry.exists(user)?;
        tracing::info!(user, existing, known, "registration started");

        let mut machine = RegistrationMachine::new(self.limits);
        let mut action = machine.handle(RegistrationEvent::Start {
            user: user.to_string(),
            existing,
            known,
        })?;

        loop {
            let event = match action {
                RegistrationAction::Finish(outcome) => {
                    tracing::info!(?outcome, "registration finished");
                    return Ok(outcome);
                }
                _ if self.is_cancelled() => RegistrationEvent::Cancel,
                RegistrationAction::Prompt { user, count } => self.prompt(&user, count)?,
                RegistrationAction::Capture {
                    user,
                    target,
                    create_identity,
                } => {
                    if create_identity && self.services.registry.create(&user)? {
                        tracing::info!(user = %user, "identity created");
                    }
                    match self.capture(&user, target)? {
                        Some(count) => RegistrationEvent::CaptureComplete { count },
                        None => RegistrationEvent::Cancel,
                    }
                }
                RegistrationAction::Train { user } => {
                    self.train(&user);
                    RegistrationEvent::TrainingDone
                }
            };
            action = machine.handle(event)?;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn prompt(&self, user: &str, count: usize) -> Result<RegistrationEvent, RegistrationError> {
        let question = if count >= self.limits.max {
            format!("{user} already has {count} photos (the maximum). Retrain anyway?")
        } else {
            format!("{user} has {count} photos. Capture up to {} more?", self.limits.step)
        };
        if self.services.operator.confirm("Registration", &question) {
            let count = self.services.store.count(user)?;
            Ok(RegistrationEvent::Resume { count })
        } else {
            Ok(RegistrationEvent::Decline)
        }
    }

    /// Capture until `user` owns `target` photos. `None` means cancelled.
    fn capture(&self, user: &str, target: usize) -> Result<Option<usize>, RegistrationError> {
        let ops = &self.services;
        let mut count = ops.store.count(user)?;
        if count >= target {
            return Ok(Some(count));
        }

        let frames = ops.camera.start()?;
        let _camera = CameraGuard(&ops.camera);
        tracing::info!(user, count, target, "capturing");
        ops.operator.progress(user, count, target, self.limits.max);

        while count < target {
            if self.is_cancelled() {
                return Ok(None);
            }
            let frame = match frames.recv_timeout(FRAME_WAIT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::error!(user, count, "camera lost during registration");
                    ops.operator.notify(Level::Error, "Camera", "the camera stopped delivering frames");
                    return Err(RegistrationError::CameraLost);
                }
            };

            let image = match frame_image(frame.data, frame.width, frame.height) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed frame");
                    continue;
                }
            };
            let faces = match ops.analyzer.lock().detect(&image) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, "detection failed");
                    continue;
                }
            };
            ops.operator.preview(&lockface_core::annotate(&image, &faces));

            match faces.as_slice() {
                [face] => {
                    let Some(crop) = crop_face(&image, face) else {
                        continue;
                    };
                    count = ops.store.add(user, &crop)?;
                    tracing::debug!(user, count, target, "photo captured");
                    ops.operator.progress(user, count, target, self.limits.max);
                }
                [] => ops.operator.status("No face detected"),
                _ => ops.operator.status("Multiple faces detected; only one person may be in view"),
            }
        }

        tracing::info!(user, count, "capture target reached");
        Ok(Some(count))
    }

    /// Train and wait for the outcome. Failures are reported, not fatal.
    fn train(&self, user: &str) {
        let ops = &self.services;
        ops.operator.status("Training...");
        let (tx, rx) = crossbeam_channel::bounded(1);
        ops.training.request(Some(tx));

        match rx.recv() {
            Ok(TrainingEvent::Completed { accuracy }) => {
                tracing::info!(user, accuracy, "model retrained");
                ops.operator.notify(
                    Level::Info,
                    "Training",
                    &format!("model trained, accuracy {:.1}%", accuracy * 100.0),
                );
            }
            Ok(TrainingEvent::NoImages) => {
                ops.operator.notify(Level::Warning, "Training", "no photos to train on; register a user first");
            }
            Ok(TrainingEvent::Failed(message)) => {
                ops.operator.notify(Level::Error, "Training", &message);
            }
            Err(_) => {
                tracing::error!("training worker went away");
                ops.operator.notify(Level::Error, "Training", "training did not report a result");
            }
        }
    }
}
