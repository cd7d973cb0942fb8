use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use roaring::RoaringTreemap;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{DensityThreshold, EngineConfig};
use crate::construct::{CandidateSet, MatchedObservations, SubjectId};
use crate::error::{CandidateError, Result};
use crate::hydrate::Hydrator;
use crate::persist;
use crate::strategy::{self, Plan, Scope, Strategy};
use crate::transient::{BulkPopulationPolicy, NoHints, SqliteHints};

/// The outcome of one resolution together with how it was reached.
#[derive(Debug)]
pub struct Resolution {
    pub candidates: CandidateSet,
    pub plan: Plan,
    /// Statements that read observation data.
    pub observation_scans: usize,
    pub elapsed: Duration,
}

/// Resolves which filter items of a subject remain selectable.
pub struct CandidateEngine {
    threshold: DensityThreshold,
    policy: Arc<dyn BulkPopulationPolicy>,
}

impl CandidateEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let policy: Arc<dyn BulkPopulationPolicy> = if config.bulk_hints {
            Arc::new(SqliteHints::new(config.max_workers))
        } else {
            Arc::new(NoHints)
        };
        Ok(Self {
            threshold: config.threshold()?,
            policy,
        })
    }
    pub fn with_policy(threshold: DensityThreshold, policy: Arc<dyn BulkPopulationPolicy>) -> Self {
        Self { threshold, policy }
    }
    pub fn threshold(&self) -> DensityThreshold {
        self.threshold
    }
    pub fn policy(&self) -> &dyn BulkPopulationPolicy {
        self.policy.as_ref()
    }

    pub fn resolve(
        &self,
        conn: &Connection,
        subject: SubjectId,
        matched: &MatchedObservations,
        cancel: &CancelToken,
    ) -> Result<CandidateSet> {
        self.resolve_with_report(conn, subject, matched, cancel)
            .map(|resolution| resolution.candidates)
    }

    pub fn resolve_with_report(
        &self,
        conn: &Connection,
        subject: SubjectId,
        matched: &MatchedObservations,
        cancel: &CancelToken,
    ) -> Result<Resolution> {
        let started = Instant::now();
        let _watch = cancel.watch(conn);
        cancel.check()?;
        let total =
            persist::observation_count(conn, subject)?.ok_or(CandidateError::InvalidSubject(subject))?;
        let plan = strategy::select(matched, total, self.threshold);
        debug!(subject = %subject, total, matched = ?matched.count(), %plan, "plan selected");
        let (candidates, observation_scans) = match plan {
            Plan::Empty => (CandidateSet::empty(), 0),
            Plan::Run(chosen) => self.execute(conn, subject, chosen, matched, cancel)?,
        };
        let elapsed = started.elapsed();
        info!(
            subject = %subject,
            %plan,
            candidates = candidates.len(),
            ms = elapsed.as_secs_f64() * 1000.0,
            "filter item candidates resolved"
        );
        Ok(Resolution {
            candidates,
            plan,
            observation_scans,
            elapsed,
        })
    }

    /// Runs a given strategy regardless of density.
    pub fn resolve_using(
        &self,
        conn: &Connection,
        subject: SubjectId,
        chosen: Strategy,
        matched: &MatchedObservations,
        cancel: &CancelToken,
    ) -> Result<CandidateSet> {
        let _watch = cancel.watch(conn);
        cancel.check()?;
        persist::observation_count(conn, subject)?.ok_or(CandidateError::InvalidSubject(subject))?;
        if matched.count() == Some(0) {
            return Ok(CandidateSet::empty());
        }
        self.execute(conn, subject, chosen, matched, cancel)
            .map(|(candidates, _)| candidates)
    }

    /// Hydrates caller supplied identities for a subject.
    pub fn hydrate_ids(
        &self,
        conn: &Connection,
        subject: SubjectId,
        ids: &RoaringTreemap,
        cancel: &CancelToken,
    ) -> Result<CandidateSet> {
        let _watch = cancel.watch(conn);
        Hydrator::new(conn, subject, cancel).hydrate_ids(ids, self.policy())
    }

    fn execute(
        &self,
        conn: &Connection,
        subject: SubjectId,
        chosen: Strategy,
        matched: &MatchedObservations,
        cancel: &CancelToken,
    ) -> Result<(CandidateSet, usize)> {
        let scope = Scope::new(conn, subject, self.policy(), cancel);
        let candidates = strategy::run(chosen, &scope, matched)?;
        let hydrated = Hydrator::new(conn, subject, cancel).hydrate(&candidates)?;
        Ok((hydrated, scope.observation_scans()))
    }
}
