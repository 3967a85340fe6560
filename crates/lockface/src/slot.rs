//! The single system-wide "a session is running" flag.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Registration,
    Recognition,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration => f.write_str("registration"),
            Self::Recognition => f.write_str("recognition"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlotError {
    #[error("a {0} session is already active")]
    Busy(SessionKind),
}

/// At most one registration or recognition session holds the camera and
/// writes photos at any time.
#[derive(Debug, Default)]
pub struct SessionSlot {
    active: Mutex<Option<SessionKind>>,
}

impl SessionSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(self: &Arc<Self>, kind: SessionKind) -> Result<SessionLease, SlotError> {
        let mut active = self.active.lock();
        if let Some(current) = *active {
            return Err(SlotError::Busy(current));
        }
        *active = Some(kind);
        tracing::debug!(%kind, "session slot acquired");
        Ok(SessionLease {
            slot: Arc::clone(self),
            kind,
        })
    }

    pub fn active(&self) -> Option<SessionKind> {
        *self.active.lock()
    }
}

/// Holds the slot until dropped.
#[derive(Debug)]
pub struct SessionLease {
    slot: Arc<SessionSlot>,
    kind: SessionKind,
}

impl SessionLease {
    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        *self.slot.active.lock() = None;
        tracing::debug!(kind = %self.kind, "session slot released");
    }
}
