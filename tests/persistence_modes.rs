mod common;

use filter_candidates::persist::{PersistenceMode, Persistor, Store, observation_count, subject_filter_item_ids};
use filter_candidates::transient::{NoHints, TransientRelation, live_relations};
use filter_candidates::{CancelToken, MatchedObservations};

use common::{engine, fixture, ids};

#[test]
fn in_memory_sessions_share_data_but_not_transient_relations() {
    let f = fixture(30, true);
    let first = f.session();
    let second = f.session();
    assert_eq!(observation_count(&second, f.subject).unwrap(), Some(30));

    let cancel = CancelToken::new();
    let relation = TransientRelation::create_and_populate(&first, "private", [1, 2, 3], &NoHints, &cancel).unwrap();
    assert_eq!(live_relations(&first).unwrap(), vec![relation.name().to_string()]);
    assert!(live_relations(&second).unwrap().is_empty());
    drop(relation);
    assert!(live_relations(&first).unwrap().is_empty());
}

#[test]
fn separate_in_memory_stores_are_separate_databases() {
    let a = fixture(5, true);
    let b = Store::new(PersistenceMode::InMemory).unwrap();
    let conn = b.session().unwrap();
    assert_eq!(observation_count(&conn, a.subject).unwrap(), None);
}

#[test]
fn file_store_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("candidates.db").to_string_lossy().into_owned();
    let (subject, item) = {
        let store = Store::new(PersistenceMode::File(path.clone())).unwrap();
        let conn = store.session().unwrap();
        let mut persistor = Persistor::new(&conn).unwrap();
        persistor
            .bulk(|p| {
                let subject = p.add_subject("School workforce")?;
                let filter = p.add_filter(subject, "role", "Role", Some("Post held"))?;
                let group = p.add_filter_group(filter, "All roles")?;
                let item = p.add_filter_item(group, "Teacher")?;
                for year in 2019..2024 {
                    p.add_observation(subject, "E09000001", year, &[item])?;
                }
                Ok((subject, item))
            })
            .unwrap()
    };

    let store = Store::new(PersistenceMode::File(path.clone())).unwrap();
    assert_eq!(store.mode(), &PersistenceMode::File(path));
    let conn = store.session().unwrap();
    assert_eq!(observation_count(&conn, subject).unwrap(), Some(5));
    assert_eq!(subject_filter_item_ids(&conn, subject).unwrap(), ids([item]));
    let candidates = engine(0.3)
        .resolve(&conn, subject, &MatchedObservations::Unconstrained, &CancelToken::new())
        .unwrap();
    assert_eq!(candidates.labels(), vec!["Teacher"]);
    assert_eq!(candidates.iter().next().unwrap().filter().hint(), Some("Post held"));
}

#[test]
fn recount_matches_the_cached_count() {
    let f = fixture(64, true);
    let conn = f.session();
    let mut persistor = Persistor::new(&conn).unwrap();
    assert_eq!(persistor.recount_observations(f.subject).unwrap(), 64);
    assert_eq!(persistor.recount_observations(f.other_subject).unwrap(), 10);
}

#[test]
fn failed_bulk_load_is_rolled_back() {
    let f = fixture(10, true);
    let conn = f.session();
    let mut persistor = Persistor::new(&conn).unwrap();
    let result: filter_candidates::Result<()> = persistor.bulk(|p| {
        p.add_observation(f.subject, "E09000001", 2024, &[f.male])?;
        Err(filter_candidates::CandidateError::InconsistentState("abandoned".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(observation_count(&conn, f.subject).unwrap(), Some(10));
}
