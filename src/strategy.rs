//! Candidate strategies and the selection between them.
//!
//! Three ways of finding the filter items of a subject that at least one
//! matched observation refers to:
//! * [`Strategy::AllMatched`] – nothing narrowed yet, every item qualifies.
//! * [`Strategy::Dense`] – driven by the subject's filter items, probing for
//!   one matched observation per item. Fast when most observations match.
//! * [`Strategy::Sparse`] – driven by the matched observations, collecting the
//!   distinct items they refer to. Fast when few observations match.
//!
//! Dense and Sparse always agree; the choice only affects speed.

use std::cell::Cell;
use std::fmt;

use rusqlite::{Connection, params};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::DensityThreshold;
use crate::construct::{MatchedObservations, ObservationSetRef, SubjectId};
use crate::error::{CandidateError, Result};
use crate::transient::{BulkPopulationPolicy, TransientRelation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    AllMatched,
    Dense,
    Sparse,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Strategy::AllMatched => f.write_str("all-matched"),
            Strategy::Dense => f.write_str("dense"),
            Strategy::Sparse => f.write_str("sparse"),
        }
    }
}

/// What a resolution is going to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Zero matched observations, nothing can be a candidate.
    Empty,
    Run(Strategy),
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Plan::Empty => f.write_str("empty"),
            Plan::Run(strategy) => strategy.fmt(f),
        }
    }
}

/// Picks the plan for `matched` given the subject's cached observation total.
pub fn select(matched: &MatchedObservations, total: u64, threshold: DensityThreshold) -> Plan {
    match matched.count() {
        None => Plan::Run(Strategy::AllMatched),
        Some(0) => Plan::Empty,
        Some(count) if threshold.reached_by(count, total) => Plan::Run(Strategy::Dense),
        Some(_) => Plan::Run(Strategy::Sparse),
    }
}

// ------------- Scope -------------
/// Everything a strategy needs for one resolution on one session.
pub struct Scope<'c> {
    pub conn: &'c Connection,
    pub subject: SubjectId,
    pub policy: &'c dyn BulkPopulationPolicy,
    pub cancel: &'c CancelToken,
    observation_scans: Cell<usize>,
}

impl<'c> Scope<'c> {
    pub fn new(
        conn: &'c Connection,
        subject: SubjectId,
        policy: &'c dyn BulkPopulationPolicy,
        cancel: &'c CancelToken,
    ) -> Self {
        Self {
            conn,
            subject,
            policy,
            cancel,
            observation_scans: Cell::new(0),
        }
    }
    /// Statements run so far that read observation data.
    pub fn observation_scans(&self) -> usize {
        self.observation_scans.get()
    }
    fn scanned_observations(&self) {
        self.observation_scans.set(self.observation_scans.get() + 1);
    }
}

/// The identities a strategy settled on, not yet hydrated.
pub enum Candidates<'c> {
    Nothing,
    /// Every filter item of the subject.
    AllOfSubject,
    Relation(TransientRelation<'c>),
}

/// Runs one strategy. `matched` is ignored by [`Strategy::AllMatched`].
pub fn run<'c>(
    strategy: Strategy,
    scope: &Scope<'c>,
    matched: &MatchedObservations,
) -> Result<Candidates<'c>> {
    match (strategy, matched) {
        (Strategy::AllMatched, _) => all_matched(scope),
        (Strategy::Dense, MatchedObservations::Bounded { source, .. }) => dense(scope, source),
        (Strategy::Sparse, MatchedObservations::Bounded { source, .. }) => sparse(scope, source),
        (_, MatchedObservations::Unconstrained) => Err(CandidateError::InconsistentState(format!(
            "{strategy} strategy needs a bounded observation set"
        ))),
    }
}

// ------------- All matched -------------
fn all_matched<'c>(scope: &Scope<'c>) -> Result<Candidates<'c>> {
    scope.cancel.check()?;
    debug!(subject = %scope.subject, "every filter item of the subject is a candidate");
    Ok(Candidates::AllOfSubject)
}

// ------------- Matched observation source -------------
enum MatchedSource<'c> {
    Materialized(TransientRelation<'c>),
    Provided(String),
}

impl MatchedSource<'_> {
    fn relation(&self) -> String {
        match self {
            MatchedSource::Materialized(relation) => relation.qualified(),
            MatchedSource::Provided(name) => name.clone(),
        }
    }
}

fn matched_source<'c>(scope: &Scope<'c>, source: &ObservationSetRef) -> Result<MatchedSource<'c>> {
    match source {
        ObservationSetRef::Ids(ids) => {
            let mut relation = TransientRelation::create_and_populate(
                scope.conn,
                "matched_observations",
                ids.iter(),
                scope.policy,
                scope.cancel,
            )?;
            relation.build_unique_index(scope.cancel)?;
            relation.refresh_statistics(scope.policy, scope.cancel)?;
            Ok(MatchedSource::Materialized(relation))
        }
        ObservationSetRef::Relation(name) => Ok(MatchedSource::Provided(name.to_string())),
    }
}

// ------------- Dense -------------
fn dense<'c>(scope: &Scope<'c>, source: &ObservationSetRef) -> Result<Candidates<'c>> {
    // the driving set: every filter item of the subject
    let items = TransientRelation::create(scope.conn, "subject_filter_items", scope.cancel)?;
    let driving = items.populate_with(
        &format!(
            "
            insert into {items} (Id)
                select fi.FilterItem_Identity
                    from Filter f
                    join FilterGroup fg
                    on fg.Filter_Identity = f.Filter_Identity
                    join FilterItem fi
                    on fi.FilterGroup_Identity = fg.FilterGroup_Identity
                    where f.Subject_Identity = ?
        ",
            items = items.qualified()
        ),
        params![scope.subject],
        scope.policy,
        scope.cancel,
    )?;
    if driving == 0 {
        return Ok(Candidates::Nothing);
    }
    items.refresh_statistics(scope.policy, scope.cancel)?;
    let matched = matched_source(scope, source)?;

    let mut result = TransientRelation::create(scope.conn, "dense_filter_items", scope.cancel)?;
    scope.scanned_observations();
    let found = result.populate_with(
        &format!(
            "
            insert into {result} (Id)
                select c.Id
                    from {items} c
                    where exists (
                        select 1
                            from ObservationFilterItem ofi
                            join {matched} m
                            on m.Id = ofi.Observation_Identity
                            where ofi.FilterItem_Identity = c.Id
                    )
        ",
            result = result.qualified(),
            items = items.qualified(),
            matched = matched.relation()
        ),
        [],
        scope.policy,
        scope.cancel,
    )?;
    result.build_unique_index(scope.cancel)?;
    result.refresh_statistics(scope.policy, scope.cancel)?;
    debug!(subject = %scope.subject, driving, found, "dense probe finished");
    Ok(Candidates::Relation(result))
}

// ------------- Sparse -------------
fn sparse<'c>(scope: &Scope<'c>, source: &ObservationSetRef) -> Result<Candidates<'c>> {
    let matched = matched_source(scope, source)?;

    let mut result = TransientRelation::create(scope.conn, "sparse_filter_items", scope.cancel)?;
    scope.scanned_observations();
    // observations of other subjects never contribute, whatever the caller matched
    let found = result.populate_with(
        &format!(
            "
            insert into {result} (Id)
                select distinct ofi.FilterItem_Identity
                    from {matched} m
                    join Observation o
                    on o.Observation_Identity = m.Id
                    and o.Subject_Identity = ?
                    join ObservationFilterItem ofi
                    on ofi.Observation_Identity = m.Id
        ",
            result = result.qualified(),
            matched = matched.relation()
        ),
        params![scope.subject],
        scope.policy,
        scope.cancel,
    )?;
    result.build_unique_index(scope.cancel)?;
    result.refresh_statistics(scope.policy, scope.cancel)?;
    debug!(subject = %scope.subject, found, "sparse collection finished");
    Ok(Candidates::Relation(result))
}
