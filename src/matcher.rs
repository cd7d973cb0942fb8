//! Narrows a subject's observations by location, time period and filter items.
//!
//! This is the step that runs before candidate resolution; it hands over its
//! result as [`MatchedObservations`].

use rusqlite::Connection;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use roaring::RoaringTreemap;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::construct::{FilterItemId, MatchedObservations, SubjectId, Thing};
use crate::error::{Result, Step, StepContext};

#[derive(Debug, Clone, Default)]
pub struct ObservationQuery {
    /// Location codes, any of which matches.
    pub locations: Vec<String>,
    /// Inclusive range of time periods.
    pub time_periods: Option<(i32, i32)>,
    /// Filter items, any of which an observation must refer to.
    pub filter_items: Vec<FilterItemId>,
}

impl ObservationQuery {
    pub fn is_unconstrained(&self) -> bool {
        self.locations.is_empty() && self.time_periods.is_none() && self.filter_items.is_empty()
    }
}

pub fn match_observations(
    conn: &Connection,
    subject: SubjectId,
    query: &ObservationQuery,
    cancel: &CancelToken,
) -> Result<MatchedObservations> {
    if query.is_unconstrained() {
        return Ok(MatchedObservations::Unconstrained);
    }
    cancel.check()?;
    let mut sql = String::from(
        "
        select o.Observation_Identity
            from Observation o
            where o.Subject_Identity = ?",
    );
    let mut values = vec![Value::Blob(subject.as_bytes().to_vec())];
    if !query.locations.is_empty() {
        sql += &format!(
            "
            and o.LocationCode in ({})",
            placeholders(query.locations.len())
        );
        values.extend(query.locations.iter().cloned().map(Value::Text));
    }
    if let Some((from, to)) = query.time_periods {
        sql += "
            and o.TimePeriod between ? and ?";
        values.push(Value::Integer(from.into()));
        values.push(Value::Integer(to.into()));
    }
    if !query.filter_items.is_empty() {
        sql += &format!(
            "
            and exists (
                select 1
                    from ObservationFilterItem ofi
                    where ofi.Observation_Identity = o.Observation_Identity
                    and ofi.FilterItem_Identity in ({})
            )",
            placeholders(query.filter_items.len())
        );
        for item in &query.filter_items {
            values.push(Value::Integer(*item as i64));
        }
    }
    let mut statement = conn.prepare(&sql).at(Step::MatchObservations)?;
    let ids = statement
        .query_map(params_from_iter(values), |r| r.get::<_, Thing>(0))
        .at(Step::MatchObservations)?
        .collect::<rusqlite::Result<RoaringTreemap>>()
        .at(Step::MatchObservations)?;
    debug!(subject = %subject, matched = ids.len(), "observations matched");
    Ok(MatchedObservations::from_ids(ids))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
