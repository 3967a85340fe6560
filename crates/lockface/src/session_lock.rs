//! Lock state of the desktop session, read from systemd-logind.

use std::time::Duration;
use zbus::proxy::CacheProperties;

const LOGIND_TIMEOUT: Duration = Duration::from_secs(3);

// `#[zbus::proxy]` generates `LogindSessionProxy` (async) and
// `LogindSessionProxyBlocking`; only the blocking variant is used.
#[zbus::proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1/session/auto"
)]
pub(crate) trait LogindSession {
    async fn unlock(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn locked_hint(&self) -> zbus::Result<bool>;
}

/// Connect to the caller's logind session on the system bus.
///
/// Properties are not cached: every read goes to the bus.
pub(crate) fn connect_session() -> zbus::Result<LogindSessionProxyBlocking<'static>> {
    let conn = zbus::blocking::connection::Builder::system()?
        .method_timeout(LOGIND_TIMEOUT)
        .build()?;
    LogindSessionProxyBlocking::builder(&conn)
        .cache_properties(CacheProperties::No)
        .build()
}

/// "Is the protected session locked right now?" Polled, never pushed.
pub trait LockSignal: Send + Sync {
    fn is_locked(&self) -> bool;
}

pub struct LogindLockSignal {
    session: LogindSessionProxyBlocking<'static>,
}

impl LogindLockSignal {
    pub fn connect() -> zbus::Result<Self> {
        Ok(Self {
            session: connect_session()?,
        })
    }
}

impl LockSignal for LogindLockSignal {
    fn is_locked(&self) -> bool {
        match self.session.locked_hint() {
            Ok(locked) => locked,
            Err(e) => {
                tracing::warn!(error = %e, "LockedHint query failed; treating session as unlocked");
                false
            }
        }
    }
}
