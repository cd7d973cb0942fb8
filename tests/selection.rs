mod common;

use roaring::RoaringTreemap;

use filter_candidates::{CancelToken, CandidateError, MatchedObservations, Plan, Strategy, SubjectId};

use common::{assert_no_transient_relations, engine, fixture, ids, sorted_labels};

#[test]
fn unconstrained_returns_every_item_without_reading_observations() {
    let f = fixture(100, true);
    let conn = f.session();
    let resolution = engine(0.3)
        .resolve_with_report(&conn, f.subject, &MatchedObservations::Unconstrained, &CancelToken::new())
        .unwrap();
    assert_eq!(resolution.plan, Plan::Run(Strategy::AllMatched));
    assert_eq!(resolution.observation_scans, 0);
    assert_eq!(resolution.candidates.ids(), f.all_items());
    // never observed, still offered before anything is narrowed
    assert!(resolution.candidates.contains(f.unknown));
    assert!(!resolution.candidates.contains(f.other_item));
    assert_no_transient_relations(&conn);
}

#[test]
fn nothing_matched_returns_nothing_without_reading_observations() {
    let f = fixture(100, true);
    let conn = f.session();
    let resolution = engine(0.3)
        .resolve_with_report(
            &conn,
            f.subject,
            &MatchedObservations::from_ids(RoaringTreemap::new()),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(resolution.plan, Plan::Empty);
    assert_eq!(resolution.observation_scans, 0);
    assert!(resolution.candidates.is_empty());
}

#[test]
fn threshold_boundary_picks_dense_at_and_sparse_below() {
    let f = fixture(1_000, true);
    let conn = f.session();
    let cancel = CancelToken::new();
    let engine = engine(0.25);

    let at = MatchedObservations::from_ids(ids(f.observations[..250].iter().copied()));
    let dense = engine.resolve_with_report(&conn, f.subject, &at, &cancel).unwrap();
    assert_eq!(dense.plan, Plan::Run(Strategy::Dense));
    assert_eq!(dense.observation_scans, 1);
    let other = engine
        .resolve_using(&conn, f.subject, Strategy::Sparse, &at, &cancel)
        .unwrap();
    assert_eq!(dense.candidates.ids(), other.ids());

    let below = MatchedObservations::from_ids(ids(f.observations[..249].iter().copied()));
    let sparse = engine.resolve_with_report(&conn, f.subject, &below, &cancel).unwrap();
    assert_eq!(sparse.plan, Plan::Run(Strategy::Sparse));
    assert_eq!(sparse.observation_scans, 1);
    let other = engine
        .resolve_using(&conn, f.subject, Strategy::Dense, &below, &cancel)
        .unwrap();
    assert_eq!(sparse.candidates.ids(), other.ids());
    assert_no_transient_relations(&conn);
}

#[test]
fn every_matched_observation_is_dense() {
    let f = fixture(200, true);
    let conn = f.session();
    let matched = MatchedObservations::from_ids(ids(f.observations.iter().copied()));
    let resolution = engine(1.0)
        .resolve_with_report(&conn, f.subject, &matched, &CancelToken::new())
        .unwrap();
    assert_eq!(resolution.plan, Plan::Run(Strategy::Dense));
    assert_eq!(sorted_labels(&resolution.candidates), vec!["0-5", "6-10", "Female", "Male"]);
}

#[test]
fn unknown_subject_is_rejected() {
    let f = fixture(10, true);
    let conn = f.session();
    let stranger = SubjectId::new_v4();
    for matched in [
        MatchedObservations::Unconstrained,
        MatchedObservations::from_ids(RoaringTreemap::new()),
        MatchedObservations::from_ids(ids(f.observations.iter().copied())),
    ] {
        let result = engine(0.3).resolve(&conn, stranger, &matched, &CancelToken::new());
        assert!(matches!(result, Err(CandidateError::InvalidSubject(s)) if s == stranger));
    }
}

#[test]
fn subject_without_observations_has_no_candidates_once_narrowed() {
    let f = fixture(10, true);
    let conn = f.session();
    let mut persistor = filter_candidates::persist::Persistor::new(&conn).unwrap();
    let empty = persistor.add_subject("Not yet loaded").unwrap();
    let filter = persistor.add_filter(empty, "phase", "Phase", None).unwrap();
    let group = persistor.add_filter_group(filter, "All phases").unwrap();
    persistor.add_filter_item(group, "Primary").unwrap();
    drop(persistor);

    let engine = engine(0.3);
    let cancel = CancelToken::new();
    let narrowed = engine
        .resolve_with_report(&conn, empty, &MatchedObservations::from_ids(RoaringTreemap::new()), &cancel)
        .unwrap();
    assert_eq!(narrowed.plan, Plan::Empty);
    let everything = engine
        .resolve(&conn, empty, &MatchedObservations::Unconstrained, &cancel)
        .unwrap();
    assert_eq!(everything.labels(), vec!["Primary"]);
}
