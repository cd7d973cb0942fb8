//! Turns candidate identities into filter items with their groups and filters.
//!
//! Identities coming out of a transient relation are not trusted: every
//! hydrated item is checked against the subject it was resolved for, and an
//! identity that does not hydrate at all is reported as well. Neither case is
//! filtered out silently.

use std::sync::Arc;

use rusqlite::{Connection, Row, params};
use roaring::RoaringTreemap;
use tracing::error;

use crate::cancel::CancelToken;
use crate::construct::{
    CandidateSet, Filter, FilterGroup, FilterGroupKeeper, FilterItem, FilterKeeper, SubjectId, Thing,
};
use crate::error::{CandidateError, Result, Step, StepContext};
use crate::strategy::Candidates;
use crate::transient::{BulkPopulationPolicy, TransientRelation};

const COLUMNS: &str = "
    fi.FilterItem_Identity,
    fi.Label,
    fg.FilterGroup_Identity,
    fg.Label,
    f.Filter_Identity,
    f.Subject_Identity,
    f.Name,
    f.Label,
    f.Hint
";

struct HydratedRow {
    item: Thing,
    item_label: String,
    group: Thing,
    group_label: String,
    filter: Thing,
    subject: SubjectId,
    name: String,
    filter_label: String,
    hint: Option<String>,
}

fn hydrated_row(row: &Row) -> rusqlite::Result<HydratedRow> {
    Ok(HydratedRow {
        item: row.get(0)?,
        item_label: row.get(1)?,
        group: row.get(2)?,
        group_label: row.get(3)?,
        filter: row.get(4)?,
        subject: row.get(5)?,
        name: row.get(6)?,
        filter_label: row.get(7)?,
        hint: row.get(8)?,
    })
}

pub struct Hydrator<'c> {
    conn: &'c Connection,
    subject: SubjectId,
    cancel: &'c CancelToken,
    filters: FilterKeeper,
    groups: FilterGroupKeeper,
}

impl<'c> Hydrator<'c> {
    pub fn new(conn: &'c Connection, subject: SubjectId, cancel: &'c CancelToken) -> Self {
        Self {
            conn,
            subject,
            cancel,
            filters: FilterKeeper::new(),
            groups: FilterGroupKeeper::new(),
        }
    }

    /// Hydrates whatever a strategy produced.
    pub fn hydrate(mut self, candidates: &Candidates<'_>) -> Result<CandidateSet> {
        match candidates {
            Candidates::Nothing => Ok(CandidateSet::empty()),
            Candidates::AllOfSubject => self.hydrate_subject(),
            Candidates::Relation(relation) => self.hydrate_relation(relation),
        }
    }

    /// Hydrates an arbitrary identity set. Empty input never touches the store.
    pub fn hydrate_ids(
        self,
        ids: &RoaringTreemap,
        policy: &dyn BulkPopulationPolicy,
    ) -> Result<CandidateSet> {
        if ids.is_empty() {
            return Ok(CandidateSet::empty());
        }
        let mut relation = TransientRelation::create_and_populate(
            self.conn,
            "hydrate_filter_items",
            ids.iter(),
            policy,
            self.cancel,
        )?;
        relation.build_unique_index(self.cancel)?;
        self.hydrate(&Candidates::Relation(relation))
    }

    fn hydrate_subject(&mut self) -> Result<CandidateSet> {
        self.cancel.check()?;
        let mut statement = self
            .conn
            .prepare_cached(&format!(
                "
                select {COLUMNS}
                    from Filter f
                    join FilterGroup fg
                    on fg.Filter_Identity = f.Filter_Identity
                    join FilterItem fi
                    on fi.FilterGroup_Identity = fg.FilterGroup_Identity
                    where f.Subject_Identity = ?
            "
            ))
            .at(Step::Hydrate)?;
        let rows = statement
            .query_map(params![self.subject], hydrated_row)
            .at(Step::Hydrate)?
            .collect::<rusqlite::Result<Vec<HydratedRow>>>()
            .at(Step::Hydrate)?;
        self.assemble(rows)
    }

    fn hydrate_relation(&mut self, relation: &TransientRelation<'_>) -> Result<CandidateSet> {
        let expected = relation.len(self.cancel)?;
        if expected == 0 {
            return Ok(CandidateSet::empty());
        }
        self.cancel.check()?;
        // no subject predicate here: ownership is verified per row below
        let mut statement = self
            .conn
            .prepare(&format!(
                "
                select {COLUMNS}
                    from {relation} r
                    join FilterItem fi
                    on fi.FilterItem_Identity = r.Id
                    join FilterGroup fg
                    on fg.FilterGroup_Identity = fi.FilterGroup_Identity
                    join Filter f
                    on f.Filter_Identity = fg.Filter_Identity
            ",
                relation = relation.qualified()
            ))
            .at(Step::Hydrate)?;
        let rows = statement
            .query_map([], hydrated_row)
            .at(Step::Hydrate)?
            .collect::<rusqlite::Result<Vec<HydratedRow>>>()
            .at(Step::Hydrate)?;
        if rows.len() as u64 != expected {
            let message = format!(
                "{} of {} candidate filter items could not be hydrated for subject {}",
                expected - rows.len() as u64,
                expected,
                self.subject
            );
            error!(subject = %self.subject, relation = relation.name(), %message, "hydration mismatch");
            return Err(CandidateError::InconsistentState(message));
        }
        self.assemble(rows)
    }

    fn assemble(&mut self, rows: Vec<HydratedRow>) -> Result<CandidateSet> {
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            if row.subject != self.subject {
                let message = format!(
                    "filter item {} belongs to subject {}, not {}",
                    row.item, row.subject, self.subject
                );
                error!(subject = %self.subject, item = row.item, owner = %row.subject, "foreign filter item");
                return Err(CandidateError::InconsistentState(message));
            }
            let (filter, _) = self.filters.keep(Filter::new(
                row.filter,
                row.subject,
                row.name,
                row.filter_label,
                row.hint,
            ));
            let (group, _) = self
                .groups
                .keep(FilterGroup::new(row.group, filter, row.group_label));
            items.push(Arc::new(FilterItem::new(row.item, group, row.item_label)));
        }
        Ok(CandidateSet::from_items(items))
    }
}
