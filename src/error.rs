use std::fmt;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::construct::SubjectId;

/// The stage of a resolution that talked to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    OpenSession,
    Persist,
    LookupSubject,
    CreateRelation,
    Populate,
    BuildIndex,
    RefreshStatistics,
    Hydrate,
    DropRelation,
    MatchObservations,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Step::OpenSession => "open session",
            Step::Persist => "persist",
            Step::LookupSubject => "subject lookup",
            Step::CreateRelation => "create transient relation",
            Step::Populate => "populate transient relation",
            Step::BuildIndex => "build index",
            Step::RefreshStatistics => "refresh statistics",
            Step::Hydrate => "hydrate filter items",
            Step::DropRelation => "drop transient relation",
            Step::MatchObservations => "match observations",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unknown subject: {0}")]
    InvalidSubject(SubjectId),
    #[error("Resolution cancelled")]
    Cancelled,
    #[error("Store unavailable during {step}: {source}")]
    StoreUnavailable {
        step: Step,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),
    #[error("Invalid relation name: {0}")]
    InvalidRelation(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl CandidateError {
    /// Whether the caller may reasonably retry the same resolution.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CandidateError::StoreUnavailable { .. })
    }
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CandidateError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CandidateError>;

// Helper conversions
impl From<rusqlite::Error> for CandidateError {
    fn from(e: rusqlite::Error) -> Self {
        from_store(e, Step::Persist)
    }
}

impl From<config::ConfigError> for CandidateError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

fn from_store(e: rusqlite::Error, step: Step) -> CandidateError {
    if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        CandidateError::Cancelled
    } else {
        CandidateError::StoreUnavailable { step, source: e }
    }
}

/// Attaches the failing step to a store error.
pub trait StepContext<T> {
    fn at(self, step: Step) -> Result<T>;
}

impl<T> StepContext<T> for rusqlite::Result<T> {
    fn at(self, step: Step) -> Result<T> {
        self.map_err(|e| from_store(e, step))
    }
}
