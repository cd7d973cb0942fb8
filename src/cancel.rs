//! Cooperative cancellation shared between a caller and a running resolution.
//!
//! A [`CancelToken`] is checked before every store round-trip. Sessions can be
//! registered with the token so that cancelling also interrupts whatever
//! statement is running on them at that moment.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, InterruptHandle};

use crate::error::{CandidateError, Result};

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    next_session: AtomicU64,
    sessions: Mutex<Vec<(u64, InterruptHandle)>>,
}

/// Cancellation token, cheap to clone; all clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<Shared>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        if let Ok(sessions) = self.0.sessions.lock() {
            for (_, handle) in sessions.iter() {
                handle.interrupt();
            }
        }
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Relaxed)
    }
    /// Errors with [`CandidateError::Cancelled`] once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CandidateError::Cancelled)
        } else {
            Ok(())
        }
    }
    /// Lets `cancel` interrupt statements running on `conn` until the guard is dropped.
    pub fn watch(&self, conn: &Connection) -> SessionWatch {
        let id = self.0.next_session.fetch_add(1, Ordering::Relaxed);
        let handle = conn.get_interrupt_handle();
        if let Ok(mut sessions) = self.0.sessions.lock() {
            sessions.push((id, handle));
        }
        // a cancel that raced the registration above never saw this session
        if self.is_cancelled() {
            conn.get_interrupt_handle().interrupt();
        }
        SessionWatch {
            token: self.clone(),
            id,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Deregisters a session from its token when dropped.
pub struct SessionWatch {
    token: CancelToken,
    id: u64,
}

impl Drop for SessionWatch {
    fn drop(&mut self) {
        if let Ok(mut sessions) = self.token.0.sessions.lock() {
            sessions.retain(|(id, _)| *id != self.id);
        }
    }
}
