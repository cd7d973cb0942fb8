//! Asynchronous interface for submitting and cancelling resolutions.
//!
//! Resolutions talk to SQLite synchronously, so each one runs on the blocking
//! pool with a session of its own. Callers await the result, can cancel a
//! running resolution by id, and may bound it with a timeout. Dropping the
//! awaiting future cancels the resolution as well.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::construct::{CandidateSet, MatchedObservations, SubjectId};
use crate::engine::CandidateEngine;
use crate::error::{CandidateError, Result};
use crate::persist::Store;

/// Opaque resolution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolutionId(u64);

/// Resolution submission options.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub timeout: Option<Duration>,
}

/// Registry managing resolution lifecycles.
pub struct ResolutionInterface {
    store: Arc<Store>,
    engine: Arc<CandidateEngine>,
    next_id: AtomicU64,
    active: Mutex<HashMap<ResolutionId, CancelToken>>, // for external cancellation
}

// Cancels the token unless the resolution ran to completion, and removes it
// from the registry either way.
struct Registration<'a> {
    interface: &'a ResolutionInterface,
    id: ResolutionId,
    cancel: CancelToken,
    finished: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
        if let Ok(mut active) = self.interface.active.lock() {
            active.remove(&self.id);
        }
    }
}

impl ResolutionInterface {
    pub fn new(store: Arc<Store>, engine: Arc<CandidateEngine>) -> Self {
        Self {
            store,
            engine,
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        }
    }
    pub fn store(&self) -> &Store {
        &self.store
    }
    pub fn engine(&self) -> &CandidateEngine {
        &self.engine
    }

    fn allocate_id(&self) -> ResolutionId {
        ResolutionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn register(&self, cancel: CancelToken) -> Result<Registration<'_>> {
        let id = self.allocate_id();
        self.active
            .lock()
            .map_err(|e| CandidateError::Lock(e.to_string()))?
            .insert(id, cancel.clone());
        Ok(Registration {
            interface: self,
            id,
            cancel,
            finished: false,
        })
    }

    /// Resolves on the blocking pool; `on_start` receives the id as soon as
    /// the resolution is registered so it can be cancelled from elsewhere.
    pub async fn resolve_tracked(
        &self,
        subject: SubjectId,
        matched: MatchedObservations,
        cancel: CancelToken,
        options: ResolveOptions,
        on_start: impl FnOnce(ResolutionId),
    ) -> Result<CandidateSet> {
        let mut registration = self.register(cancel.clone())?;
        on_start(registration.id);
        debug!(id = registration.id.0, subject = %subject, "resolution submitted");

        let store = Arc::clone(&self.store);
        let engine = Arc::clone(&self.engine);
        let worker_cancel = cancel.clone();
        let mut work = tokio::task::spawn_blocking(move || {
            let session = store.session()?;
            engine.resolve(&session, subject, &matched, &worker_cancel)
        });

        let joined = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut work).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(id = registration.id.0, ms = limit.as_millis() as u64, "resolution timed out");
                    cancel.cancel();
                    work.await
                }
            },
            None => work.await,
        };
        registration.finished = true;
        joined.map_err(|e| CandidateError::Worker(e.to_string()))?
    }

    pub async fn resolve(
        &self,
        subject: SubjectId,
        matched: MatchedObservations,
        cancel: CancelToken,
        options: ResolveOptions,
    ) -> Result<CandidateSet> {
        self.resolve_tracked(subject, matched, cancel, options, |_| {})
            .await
    }

    /// Cancel a resolution by id.
    pub fn cancel(&self, id: ResolutionId) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(&id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn active(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }
}
