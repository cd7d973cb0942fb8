//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use roaring::RoaringTreemap;
use rusqlite::Connection;

use filter_candidates::construct::{FilterItemId, ObservationId, SubjectId};
use filter_candidates::persist::{PersistenceMode, Persistor, Store};
use filter_candidates::transient::{NoHints, SqliteHints, live_relations};
use filter_candidates::{CandidateEngine, CandidateSet, DensityThreshold};

/// One subject with Gender {Male, Female, Unknown} and Age {0-5, 6-10}, plus a
/// second subject with a single item. "Unknown" is never observed.
pub struct Fixture {
    pub store: Arc<Store>,
    pub subject: SubjectId,
    pub male: FilterItemId,
    pub female: FilterItemId,
    pub unknown: FilterItemId,
    pub age_0_5: FilterItemId,
    pub age_6_10: FilterItemId,
    pub observations: Vec<ObservationId>,
    pub other_subject: SubjectId,
    pub other_item: FilterItemId,
    pub other_observations: Vec<ObservationId>,
}

impl Fixture {
    pub fn session(&self) -> Connection {
        self.store.session().expect("session")
    }
    /// Every item of the main subject.
    pub fn all_items(&self) -> RoaringTreemap {
        ids([self.male, self.female, self.unknown, self.age_0_5, self.age_6_10])
    }
}

struct Seeded {
    subject: SubjectId,
    male: FilterItemId,
    female: FilterItemId,
    unknown: FilterItemId,
    age_0_5: FilterItemId,
    age_6_10: FilterItemId,
    observations: Vec<ObservationId>,
    other_subject: SubjectId,
    other_item: FilterItemId,
    other_observations: Vec<ObservationId>,
}

/// Observation `i` is aged 0-5 when `i % 40` is 0 or 21 (5%), otherwise 6-10.
/// Even observations are female, odd ones male, unless `male_aged_0_5` is
/// false, in which case every 0-5 observation is female.
pub fn fixture(observations: usize, male_aged_0_5: bool) -> Fixture {
    let store = Store::new(PersistenceMode::InMemory).expect("store");
    let seeded = {
        let conn = store.session().expect("session");
        let mut persistor = Persistor::new(&conn).expect("persistor");
        persistor
            .bulk(|p| {
                let subject = p.add_subject("Pupil population")?;
                let gender = p.add_filter(subject, "gender", "Gender", None)?;
                let genders = p.add_filter_group(gender, "All genders")?;
                let male = p.add_filter_item(genders, "Male")?;
                let female = p.add_filter_item(genders, "Female")?;
                let unknown = p.add_filter_item(genders, "Unknown")?;
                let age = p.add_filter(subject, "age", "Age", Some("Age at the start of the year"))?;
                let ages = p.add_filter_group(age, "All ages")?;
                let age_0_5 = p.add_filter_item(ages, "0-5")?;
                let age_6_10 = p.add_filter_item(ages, "6-10")?;
                let mut ids = Vec::with_capacity(observations);
                for i in 0..observations {
                    let young = i % 40 == 0 || i % 40 == 21;
                    let age = if young { age_0_5 } else { age_6_10 };
                    let gender = if i % 2 == 0 || (young && !male_aged_0_5) {
                        female
                    } else {
                        male
                    };
                    let location = format!("E0900000{}", i % 3);
                    let year = 2020 + (i % 4) as i32;
                    ids.push(p.add_observation(subject, &location, year, &[gender, age])?);
                }

                let other_subject = p.add_subject("Teacher workforce")?;
                let other_filter = p.add_filter(other_subject, "gender", "Gender", None)?;
                let other_group = p.add_filter_group(other_filter, "All genders")?;
                let other_item = p.add_filter_item(other_group, "Female")?;
                let mut other_ids = Vec::new();
                for i in 0..10 {
                    other_ids.push(p.add_observation(other_subject, "E09000001", 2020 + i, &[other_item])?);
                }
                Ok(Seeded {
                    subject,
                    male,
                    female,
                    unknown,
                    age_0_5,
                    age_6_10,
                    observations: ids,
                    other_subject,
                    other_item,
                    other_observations: other_ids,
                })
            })
            .expect("seed")
    };
    Fixture {
        store: Arc::new(store),
        subject: seeded.subject,
        male: seeded.male,
        female: seeded.female,
        unknown: seeded.unknown,
        age_0_5: seeded.age_0_5,
        age_6_10: seeded.age_6_10,
        observations: seeded.observations,
        other_subject: seeded.other_subject,
        other_item: seeded.other_item,
        other_observations: seeded.other_observations,
    }
}

pub fn ids<I: IntoIterator<Item = u64>>(iter: I) -> RoaringTreemap {
    iter.into_iter().collect()
}

pub fn engine(threshold: f64) -> CandidateEngine {
    CandidateEngine::with_policy(
        DensityThreshold::new(threshold).expect("threshold"),
        Arc::new(SqliteHints::new(2)),
    )
}

pub fn engine_without_hints(threshold: f64) -> CandidateEngine {
    CandidateEngine::with_policy(DensityThreshold::new(threshold).expect("threshold"), Arc::new(NoHints))
}

pub fn sorted_labels(candidates: &CandidateSet) -> Vec<String> {
    let mut labels: Vec<String> = candidates.labels().into_iter().map(String::from).collect();
    labels.sort();
    labels
}

pub fn assert_no_transient_relations(conn: &Connection) {
    let live = live_relations(conn).expect("live relations");
    assert!(live.is_empty(), "transient relations left behind: {live:?}");
}
