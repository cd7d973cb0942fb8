mod common;

use filter_candidates::matcher::{ObservationQuery, match_observations};
use filter_candidates::{CancelToken, MatchedObservations, Strategy};
use rusqlite::params;

use common::{assert_no_transient_relations, engine, engine_without_hints, fixture, ids};

fn queries(age_0_5: u64) -> Vec<ObservationQuery> {
    vec![
        ObservationQuery {
            locations: vec!["E09000000".to_string()],
            ..Default::default()
        },
        ObservationQuery {
            time_periods: Some((2021, 2022)),
            ..Default::default()
        },
        ObservationQuery {
            locations: vec!["E09000001".to_string(), "E09000002".to_string()],
            time_periods: Some((2023, 2023)),
            ..Default::default()
        },
        ObservationQuery {
            filter_items: vec![age_0_5],
            ..Default::default()
        },
        ObservationQuery {
            locations: vec!["E09000002".to_string()],
            time_periods: Some((2020, 2020)),
            filter_items: vec![age_0_5],
        },
        ObservationQuery {
            locations: vec!["nowhere".to_string()],
            ..Default::default()
        },
    ]
}

#[test]
fn dense_and_sparse_agree_on_matched_subsets() {
    let f = fixture(400, true);
    let conn = f.session();
    let cancel = CancelToken::new();
    let engine = engine(0.3);
    for query in queries(f.age_0_5) {
        let matched = match_observations(&conn, f.subject, &query, &cancel).unwrap();
        let dense = engine
            .resolve_using(&conn, f.subject, Strategy::Dense, &matched, &cancel)
            .unwrap();
        let sparse = engine
            .resolve_using(&conn, f.subject, Strategy::Sparse, &matched, &cancel)
            .unwrap();
        assert_eq!(dense.ids(), sparse.ids(), "strategies disagree for {query:?}");
        let chosen = engine.resolve(&conn, f.subject, &matched, &cancel).unwrap();
        assert_eq!(chosen.ids(), dense.ids());
        assert_no_transient_relations(&conn);
    }
}

#[test]
fn single_observations_yield_their_own_items() {
    let f = fixture(80, true);
    let conn = f.session();
    let cancel = CancelToken::new();
    let engine = engine(0.3);
    // observation 21 is a male aged 0-5, observation 2 a female aged 6-10
    for (index, expected) in [(21, ids([f.male, f.age_0_5])), (2, ids([f.female, f.age_6_10]))] {
        let matched = MatchedObservations::from_ids(ids([f.observations[index]]));
        for strategy in [Strategy::Dense, Strategy::Sparse] {
            let candidates = engine
                .resolve_using(&conn, f.subject, strategy, &matched, &cancel)
                .unwrap();
            assert_eq!(candidates.ids(), expected, "{strategy} for observation {index}");
        }
    }
}

#[test]
fn full_match_omits_items_without_observations() {
    let f = fixture(200, true);
    let conn = f.session();
    let cancel = CancelToken::new();
    let matched = MatchedObservations::from_ids(ids(f.observations.iter().copied()));
    for strategy in [Strategy::Dense, Strategy::Sparse] {
        let candidates = engine(0.3)
            .resolve_using(&conn, f.subject, strategy, &matched, &cancel)
            .unwrap();
        assert!(!candidates.contains(f.unknown));
        assert_eq!(candidates.ids(), ids([f.male, f.female, f.age_0_5, f.age_6_10]));
    }
}

#[test]
fn population_hints_do_not_change_results() {
    let f = fixture(300, true);
    let conn = f.session();
    let cancel = CancelToken::new();
    let query = ObservationQuery {
        time_periods: Some((2022, 2023)),
        ..Default::default()
    };
    let matched = match_observations(&conn, f.subject, &query, &cancel).unwrap();
    for strategy in [Strategy::Dense, Strategy::Sparse] {
        let hinted = engine(0.3)
            .resolve_using(&conn, f.subject, strategy, &matched, &cancel)
            .unwrap();
        let plain = engine_without_hints(0.3)
            .resolve_using(&conn, f.subject, strategy, &matched, &cancel)
            .unwrap();
        assert_eq!(hinted.ids(), plain.ids());
    }
}

#[test]
fn caller_populated_relation_is_used_in_place() {
    let f = fixture(120, true);
    let conn = f.session();
    let cancel = CancelToken::new();
    conn.execute_batch("create temp table matched (Id integer primary key)")
        .unwrap();
    // every observation aged 0-5 in the first location
    let mut chosen = 0;
    for (i, observation) in f.observations.iter().enumerate() {
        if (i % 40 == 0 || i % 40 == 21) && i % 3 == 0 {
            conn.execute("insert into temp.matched (Id) values (?)", params![observation])
                .unwrap();
            chosen += 1;
        }
    }
    let matched = MatchedObservations::from_relation("temp.matched", chosen).unwrap();
    let in_memory = MatchedObservations::from_ids(ids(f
        .observations
        .iter()
        .enumerate()
        .filter(|(i, _)| (i % 40 == 0 || i % 40 == 21) && i % 3 == 0)
        .map(|(_, observation)| *observation)));

    let engine = engine(0.3);
    let expected = engine
        .resolve_using(&conn, f.subject, Strategy::Sparse, &in_memory, &cancel)
        .unwrap();
    for strategy in [Strategy::Dense, Strategy::Sparse] {
        let candidates = engine
            .resolve_using(&conn, f.subject, strategy, &matched, &cancel)
            .unwrap();
        assert_eq!(candidates.ids(), expected.ids(), "{strategy}");
    }
    assert!(expected.contains(f.age_0_5));
    assert!(!expected.contains(f.age_6_10));
    // the caller's relation is left alone
    let remaining: u64 = conn
        .query_row("select count(*) from temp.matched", [], |r| r.get(0))
        .unwrap();
    assert_eq!(remaining, chosen);
    assert_no_transient_relations(&conn);
}
