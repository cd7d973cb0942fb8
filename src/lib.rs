//! Filter item candidate resolution for a statistics table builder.
//!
//! A user narrows a *subject* (a dataset) by location and time period before
//! picking filter items. Only items that at least one of the already matched
//! observations refers to should be offered, so that no choice leads to an
//! empty table. This crate decides that candidate set.
//!
//! * A [`construct::Filter`] is a dimension (e.g. "Gender") owned by a subject.
//! * A [`construct::FilterGroup`] groups items within a filter.
//! * A [`construct::FilterItem`] is one selectable value (e.g. "Female").
//! * [`construct::MatchedObservations`] describes what has been matched so
//!   far: nothing narrowed yet, or a bounded set of observations.
//!
//! ## Strategies
//! The [`engine::CandidateEngine`] compares the matched count with the cached
//! total of the subject and picks a [`strategy::Strategy`]:
//! * *all matched* when nothing has been narrowed, without reading observations,
//! * *dense* when the matched fraction reaches the configured threshold,
//!   probing each of the subject's filter items for one matched observation,
//! * *sparse* below the threshold, collecting the distinct items the matched
//!   observations refer to.
//!
//! Dense and sparse produce identical results; only their cost differs.
//!
//! ## Transient relations
//! Intermediate identity sets live in SQLite `temp` tables owned by the
//! session (see [`transient`]). They are indexed only after population, and
//! are dropped on every exit path, cancellation included.
//!
//! ## Quick Start
//! ```
//! use filter_candidates::{CancelToken, CandidateEngine, EngineConfig, MatchedObservations};
//! use filter_candidates::persist::{PersistenceMode, Persistor, Store};
//! let store = Store::new(PersistenceMode::InMemory).unwrap();
//! let conn = store.session().unwrap();
//! let mut persistor = Persistor::new(&conn).unwrap();
//! let subject = persistor.add_subject("Pupil absence").unwrap();
//! let gender = persistor.add_filter(subject, "gender", "Gender", None).unwrap();
//! let all = persistor.add_filter_group(gender, "All genders").unwrap();
//! let female = persistor.add_filter_item(all, "Female").unwrap();
//! persistor.add_observation(subject, "E09000001", 2023, &[female]).unwrap();
//! let engine = CandidateEngine::new(&EngineConfig::default()).unwrap();
//! let candidates = engine
//!     .resolve(&conn, subject, &MatchedObservations::Unconstrained, &CancelToken::new())
//!     .unwrap();
//! assert_eq!(candidates.labels(), vec!["Female"]);
//! ```

pub mod cancel;
pub mod config;
pub mod construct;
pub mod engine;
pub mod error;
pub mod hydrate;
pub mod interface;
pub mod matcher;
pub mod persist;
pub mod strategy;
pub mod transient;

pub use cancel::CancelToken;
pub use config::{DensityThreshold, EngineConfig};
pub use construct::{CandidateSet, FilterItem, MatchedObservations, ObservationSetRef, SubjectId};
pub use engine::{CandidateEngine, Resolution};
pub use error::{CandidateError, Result};
pub use strategy::{Plan, Strategy};
