// used for persistence
use rusqlite::{Connection, OpenFlags, OptionalExtension, Statement, params};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use roaring::RoaringTreemap;
use tracing::debug;
use uuid::Uuid;

use crate::construct::{FilterGroupId, FilterId, FilterItemId, ObservationId, SubjectId, Thing};
use crate::error::{CandidateError, Result, Step, StepContext};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_IN_MEMORY: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

// ------------- Store -------------
/// Hands out sessions on one database. Every session has its own `temp`
/// schema, which is where transient relations live.
pub struct Store {
    mode: PersistenceMode,
    uri: String,
    // an in-memory database lives as long as one connection to it is open
    anchor: Mutex<Connection>,
}

impl Store {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        let uri = match &mode {
            PersistenceMode::InMemory => format!(
                "file:filter_candidates_{}_{}?mode=memory&cache=shared",
                std::process::id(),
                NEXT_IN_MEMORY.fetch_add(1, Ordering::Relaxed)
            ),
            PersistenceMode::File(path) => path.clone(),
        };
        let anchor = open(&uri)?;
        create_schema(&anchor)?;
        debug!(?mode, "store opened");
        Ok(Self {
            mode,
            uri,
            anchor: Mutex::new(anchor),
        })
    }
    pub fn mode(&self) -> &PersistenceMode {
        &self.mode
    }
    /// Opens a fresh session on the database.
    pub fn session(&self) -> Result<Connection> {
        open(&self.uri)
    }
    /// Runs `f` on the connection kept open by the store.
    pub fn with_anchor<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let anchor = self
            .anchor
            .lock()
            .map_err(|e| CandidateError::Lock(e.to_string()))?;
        f(&anchor)
    }
}

fn open(uri: &str) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(uri, flags).at(Step::OpenSession)?;
    conn.busy_timeout(BUSY_TIMEOUT).at(Step::OpenSession)?;
    Ok(conn)
}

fn create_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        create table if not exists Subject (
            Subject_Identity blob not null,
            Name text not null,
            ObservationCount integer not null default 0,
            constraint referenceable_Subject_Identity primary key (
                Subject_Identity
            )
        );
        create table if not exists Filter (
            Filter_Identity integer not null,
            Subject_Identity blob not null,
            Name text not null,
            Label text not null,
            Hint text null,
            constraint Filter_of_Subject foreign key (
                Subject_Identity
            ) references Subject(Subject_Identity),
            constraint referenceable_Filter_Identity primary key (
                Filter_Identity
            )
        );
        create index if not exists Filter_by_Subject on Filter (
            Subject_Identity
        );
        create table if not exists FilterGroup (
            FilterGroup_Identity integer not null,
            Filter_Identity integer not null,
            Label text not null,
            constraint FilterGroup_of_Filter foreign key (
                Filter_Identity
            ) references Filter(Filter_Identity),
            constraint referenceable_FilterGroup_Identity primary key (
                FilterGroup_Identity
            )
        );
        create index if not exists FilterGroup_by_Filter on FilterGroup (
            Filter_Identity
        );
        create table if not exists FilterItem (
            FilterItem_Identity integer not null,
            FilterGroup_Identity integer not null,
            Label text not null,
            constraint FilterItem_of_FilterGroup foreign key (
                FilterGroup_Identity
            ) references FilterGroup(FilterGroup_Identity),
            constraint referenceable_FilterItem_Identity primary key (
                FilterItem_Identity
            )
        );
        create index if not exists FilterItem_by_FilterGroup on FilterItem (
            FilterGroup_Identity
        );
        create table if not exists Observation (
            Observation_Identity integer not null,
            Subject_Identity blob not null,
            LocationCode text not null,
            TimePeriod integer not null,
            constraint Observation_of_Subject foreign key (
                Subject_Identity
            ) references Subject(Subject_Identity),
            constraint referenceable_Observation_Identity primary key (
                Observation_Identity
            )
        );
        create index if not exists Observation_by_Subject on Observation (
            Subject_Identity,
            LocationCode,
            TimePeriod
        );
        create table if not exists ObservationFilterItem (
            Observation_Identity integer not null,
            FilterItem_Identity integer not null,
            constraint ObservationFilterItem_of_Observation foreign key (
                Observation_Identity
            ) references Observation(Observation_Identity),
            constraint ObservationFilterItem_of_FilterItem foreign key (
                FilterItem_Identity
            ) references FilterItem(FilterItem_Identity),
            constraint unique_ObservationFilterItem primary key (
                Observation_Identity,
                FilterItem_Identity
            )
        ) without rowid;
        create index if not exists ObservationFilterItem_by_FilterItem on ObservationFilterItem (
            FilterItem_Identity,
            Observation_Identity
        );
        ",
        )
        .at(Step::Persist)
}

// ------------- Persistence -------------
/// Writes the canonical data the engine reads. The engine itself never writes
/// through a persistor.
pub struct Persistor<'db> {
    pub db: &'db Connection,
    // Adders
    pub add_subject: Statement<'db>,
    pub add_filter: Statement<'db>,
    pub add_filter_group: Statement<'db>,
    pub add_filter_item: Statement<'db>,
    pub add_observation: Statement<'db>,
    pub add_observation_filter_item: Statement<'db>,
    // Cached observation counts
    pub bump_observation_count: Statement<'db>,
    pub recount_observations: Statement<'db>,
}
impl<'db> Persistor<'db> {
    pub fn new<'connection>(connection: &'connection Connection) -> Result<Persistor<'connection>> {
        create_schema(connection)?;
        Ok(Persistor {
            db: connection,
            add_subject: connection.prepare(
                "
                insert into Subject (
                    Subject_Identity,
                    Name
                ) values (?, ?)
            ",
            )?,
            add_filter: connection.prepare(
                "
                insert into Filter (
                    Subject_Identity,
                    Name,
                    Label,
                    Hint
                ) values (?, ?, ?, ?)
            ",
            )?,
            add_filter_group: connection.prepare(
                "
                insert into FilterGroup (
                    Filter_Identity,
                    Label
                ) values (?, ?)
            ",
            )?,
            add_filter_item: connection.prepare(
                "
                insert into FilterItem (
                    FilterGroup_Identity,
                    Label
                ) values (?, ?)
            ",
            )?,
            add_observation: connection.prepare(
                "
                insert into Observation (
                    Subject_Identity,
                    LocationCode,
                    TimePeriod
                ) values (?, ?, ?)
            ",
            )?,
            add_observation_filter_item: connection.prepare(
                "
                insert or ignore into ObservationFilterItem (
                    Observation_Identity,
                    FilterItem_Identity
                ) values (?, ?)
            ",
            )?,
            bump_observation_count: connection.prepare(
                "
                update Subject
                    set ObservationCount = ObservationCount + ?
                    where Subject_Identity = ?
            ",
            )?,
            recount_observations: connection.prepare(
                "
                update Subject
                    set ObservationCount = (
                        select count(*)
                            from Observation o
                            where o.Subject_Identity = Subject.Subject_Identity
                    )
                    where Subject_Identity = ?
            ",
            )?,
        })
    }
    fn last_thing(&self) -> Thing {
        // row ids handed out by SQLite are positive
        self.db.last_insert_rowid() as Thing
    }
    pub fn add_subject(&mut self, name: &str) -> Result<SubjectId> {
        let subject = Uuid::new_v4();
        self.add_subject.execute(params![subject, name])?;
        Ok(subject)
    }
    pub fn add_filter(
        &mut self,
        subject: SubjectId,
        name: &str,
        label: &str,
        hint: Option<&str>,
    ) -> Result<FilterId> {
        self.add_filter.execute(params![subject, name, label, hint])?;
        Ok(self.last_thing())
    }
    pub fn add_filter_group(&mut self, filter: FilterId, label: &str) -> Result<FilterGroupId> {
        self.add_filter_group.execute(params![filter, label])?;
        Ok(self.last_thing())
    }
    pub fn add_filter_item(&mut self, group: FilterGroupId, label: &str) -> Result<FilterItemId> {
        self.add_filter_item.execute(params![group, label])?;
        Ok(self.last_thing())
    }
    /// Adds one observation with its filter items and keeps the cached count current.
    pub fn add_observation(
        &mut self,
        subject: SubjectId,
        location: &str,
        time_period: i32,
        items: &[FilterItemId],
    ) -> Result<ObservationId> {
        self.add_observation
            .execute(params![subject, location, time_period])?;
        let observation = self.last_thing();
        for item in items {
            self.add_observation_filter_item
                .execute(params![observation, item])?;
        }
        self.bump_observation_count.execute(params![1, subject])?;
        Ok(observation)
    }
    /// Runs `f` inside a single savepoint, rolling back if it fails.
    pub fn bulk<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.db.execute_batch("savepoint persist_bulk")?;
        match f(self) {
            Ok(value) => {
                self.db.execute_batch("release persist_bulk")?;
                Ok(value)
            }
            Err(e) => {
                self.db
                    .execute_batch("rollback to persist_bulk; release persist_bulk")?;
                Err(e)
            }
        }
    }
    /// Recomputes the cached observation count with a full scan. Maintenance
    /// only; resolution relies on the cached value.
    pub fn recount_observations(&mut self, subject: SubjectId) -> Result<u64> {
        self.recount_observations.execute(params![subject])?;
        observation_count(self.db, subject)?.ok_or(CandidateError::InvalidSubject(subject))
    }
}

// ------------- Lookups -------------
/// The cached number of observations of a subject, `None` for an unknown subject.
pub fn observation_count(conn: &Connection, subject: SubjectId) -> Result<Option<u64>> {
    conn.prepare_cached(
        "
        select ObservationCount
            from Subject
            where Subject_Identity = ?
    ",
    )
    .at(Step::LookupSubject)?
    .query_row(params![subject], |r| r.get::<_, u64>(0))
    .optional()
    .at(Step::LookupSubject)
}

/// Identities of every filter item owned by a subject.
pub fn subject_filter_item_ids(conn: &Connection, subject: SubjectId) -> Result<RoaringTreemap> {
    let mut statement = conn
        .prepare_cached(
            "
            select fi.FilterItem_Identity
                from Filter f
                join FilterGroup fg
                on fg.Filter_Identity = f.Filter_Identity
                join FilterItem fi
                on fi.FilterGroup_Identity = fg.FilterGroup_Identity
                where f.Subject_Identity = ?
        ",
        )
        .at(Step::Hydrate)?;
    let ids = statement
        .query_map(params![subject], |r| r.get::<_, Thing>(0))
        .at(Step::Hydrate)?
        .collect::<rusqlite::Result<RoaringTreemap>>()
        .at(Step::Hydrate)?;
    Ok(ids)
}
