//! Unlock actions. Attempts run off the recognition path; the outcome is
//! logged and can be waited on before exit.

use crate::session_lock::{connect_session, LogindSessionProxyBlocking};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("logind: {0}")]
    Logind(#[from] zbus::Error),
    #[error("unlock command is empty")]
    EmptyCommand,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unlock command exited with {0}")]
    Status(ExitStatus),
}

pub trait Unlocker: Send + Sync {
    fn unlock(&self, user: &str) -> Result<(), UnlockError>;
}

/// Asks logind to unlock the caller's session.
pub struct LogindUnlocker {
    session: LogindSessionProxyBlocking<'static>,
}

impl LogindUnlocker {
    pub fn connect() -> Result<Self, UnlockError> {
        Ok(Self {
            session: connect_session()?,
        })
    }
}

impl Unlocker for LogindUnlocker {
    fn unlock(&self, _user: &str) -> Result<(), UnlockError> {
        Ok(self.session.unlock()?)
    }
}

/// Runs an external command, e.g. a keystroke injector. The matched user
/// name is passed in `LOCKFACE_USER`.
#[derive(Debug, Clone)]
pub struct CommandUnlocker {
    program: String,
    args: Vec<String>,
}

impl CommandUnlocker {
    pub fn from_command_line(line: &str) -> Result<Self, UnlockError> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(UnlockError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Unlocker for CommandUnlocker {
    fn unlock(&self, user: &str) -> Result<(), UnlockError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .env("LOCKFACE_USER", user)
            .status()
            .map_err(|source| UnlockError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(UnlockError::Status(status))
        }
    }
}

/// Handle to an in-flight unlock attempt.
pub struct UnlockAttempt {
    done: Receiver<()>,
    finished: AtomicBool,
}

impl UnlockAttempt {
    /// Wait up to `timeout` for the attempt to finish and log its outcome.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return true;
        }
        let finished = matches!(
            self.done.recv_timeout(timeout),
            Ok(()) | Err(RecvTimeoutError::Disconnected)
        );
        if finished {
            self.finished.store(true, Ordering::Release);
        }
        finished
    }
}

/// Run `unlocker` on its own thread; only the outcome is logged. The caller
/// never blocks on the attempt unless it waits on the returned handle.
pub fn spawn_unlock(unlocker: Arc<dyn Unlocker>, user: String) -> UnlockAttempt {
    tracing::info!(target: "lockface::auth", user = %user, "unlock attempt");
    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name("lockface-unlock".into())
        .spawn(move || {
            match unlocker.unlock(&user) {
                Ok(()) => tracing::info!(target: "lockface::auth", user = %user, "unlock succeeded"),
                Err(e) => tracing::warn!(target: "lockface::auth", user = %user, error = %e, "unlock failed"),
            }
            let _ = tx.send(());
        });
    if let Err(e) = spawned {
        tracing::error!(target: "lockface::auth", error = %e, "failed to spawn unlock thread");
    }
    UnlockAttempt {
        done: rx,
        finished: AtomicBool::new(false),
    }
}
