//! Kill switch: the forced-termination path for a hung worker.
//!
//! A worker blocked inside a network call cannot be interrupted directly.
//! Instead its connection registers an [`Interrupt`] with the task's
//! [`KillSwitch`]; tripping the switch closes the connection and the blocked
//! call fails with an I/O error.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Something that can force a blocked connection to fail.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

impl Interrupt for TcpStream {
    fn interrupt(&self) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            tracing::debug!("Socket shutdown after kill: {e}");
        }
    }
}

#[derive(Default)]
struct Inner {
    tripped: AtomicBool,
    armed: Mutex<Option<Arc<dyn Interrupt>>>,
}

/// Shared between a task and the connection it owns.
#[derive(Clone, Default)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("tripped", &self.is_tripped())
            .finish()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the live connection. If the switch already tripped the
    /// connection is interrupted immediately.
    pub fn arm(&self, target: Arc<dyn Interrupt>) {
        let mut armed = self.inner.armed.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_tripped() {
            target.interrupt();
        }
        *armed = Some(target);
    }

    /// Forget the connection (it was closed normally).
    pub fn disarm(&self) {
        let mut armed = self.inner.armed.lock().unwrap_or_else(|e| e.into_inner());
        *armed = None;
    }

    /// Interrupt the registered connection, now and on any later `arm`.
    pub fn trip(&self) {
        let armed = self.inner.armed.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.tripped.store(true, Ordering::SeqCst);
        if let Some(target) = armed.as_ref() {
            target.interrupt();
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }
}
