//! Background training runs.
//!
//! One run at a time. Requests that arrive while a run is in progress are
//! folded into a single follow-up run, and each requester hears about the
//! first run that started after it asked.

use crossbeam_channel::Sender;
use lockface_core::{TrainError, Trainer};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    Completed { accuracy: f32 },
    /// Zero photos across all users.
    NoImages,
    Failed(String),
}

impl From<Result<f32, TrainError>> for TrainingEvent {
    fn from(result: Result<f32, TrainError>) -> Self {
        match result {
            Ok(accuracy) => Self::Completed { accuracy },
            Err(TrainError::NoTrainingImages) => Self::NoImages,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

#[derive(Default)]
struct WorkerState {
    running: bool,
    requested: bool,
    waiters: Vec<Sender<TrainingEvent>>,
    completed_runs: u64,
}

struct Shared {
    trainer: Arc<dyn Trainer>,
    state: Mutex<WorkerState>,
    idle: Condvar,
}

/// Cheap to clone; all clones drive the same worker.
#[derive(Clone)]
pub struct TrainingWorker {
    shared: Arc<Shared>,
}

impl TrainingWorker {
    pub fn new(trainer: Arc<dyn Trainer>) -> Self {
        Self {
            shared: Arc::new(Shared {
                trainer,
                state: Mutex::new(WorkerState::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Ask for a training run. `notify` receives the outcome of the run
    /// that covers this request. Never blocks on training itself.
    pub fn request(&self, notify: Option<Sender<TrainingEvent>>) {
        let mut state = self.shared.state.lock();
        state.requested = true;
        state.waiters.extend(notify);
        if state.running {
            tracing::debug!("training in progress; request queued");
            return;
        }
        state.running = true;
        drop(state);

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("lockface-train".into())
            .spawn(move || run_worker(&shared));

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn training thread");
            let mut state = self.shared.state.lock();
            state.running = false;
            state.requested = false;
            let event = TrainingEvent::Failed(format!("could not start training: {e}"));
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(event.clone());
            }
            self.shared.idle.notify_all();
        }
    }

    /// Wait until no run is active or queued. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.running {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return !state.running;
            }
        }
        true
    }

    pub fn completed_runs(&self) -> u64 {
        self.shared.state.lock().completed_runs
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let waiters = {
            let mut state = shared.state.lock();
            if !state.requested {
                state.running = false;
                shared.idle.notify_all();
                return;
            }
            state.requested = false;
            std::mem::take(&mut state.waiters)
        };

        tracing::info!("training started");
        let event = TrainingEvent::from(shared.trainer.train());
        match &event {
            TrainingEvent::Completed { accuracy } => tracing::info!(accuracy, "training finished"),
            TrainingEvent::NoImages => tracing::warn!("training skipped: no images"),
            TrainingEvent::Failed(message) => tracing::error!(error = %message, "training failed"),
        }

        shared.state.lock().completed_runs += 1;
        for waiter in waiters {
            let _ = waiter.send(event.clone());
        }
    }
}
