use std::sync::Arc;

// other keepers use HashMap
use core::hash::BuildHasherDefault;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use seahash::SeaHasher;

// custom made ordering for filter items
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

// matched observations are kept as bitmaps of identities
use roaring::RoaringTreemap;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CandidateError, Result};

// ------------- Identities -------------
pub type Thing = u64;
pub type ObservationId = Thing;
pub type FilterId = Thing;
pub type FilterGroupId = Thing;
pub type FilterItemId = Thing;

/// Opaque 128-bit identity of a Subject.
pub type SubjectId = Uuid;

pub type ThingHasher = BuildHasherDefault<SeaHasher>;

// ------------- Filter -------------
#[derive(Eq, Debug, Serialize)]
pub struct Filter {
    filter: FilterId,
    subject: SubjectId,
    name: String,
    label: String,
    hint: Option<String>,
}

impl Filter {
    pub fn new(
        filter: FilterId,
        subject: SubjectId,
        name: String,
        label: String,
        hint: Option<String>,
    ) -> Self {
        Self {
            filter,
            subject,
            name,
            label,
            hint,
        }
    }
    pub fn filter(&self) -> FilterId {
        self.filter
    }
    pub fn subject(&self) -> SubjectId {
        self.subject
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn label(&self) -> &str {
        &self.label
    }
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}
impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.filter == other.filter
    }
}
impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.filter.hash(state);
    }
}

// ------------- FilterGroup -------------
#[derive(Eq, Debug, Serialize)]
pub struct FilterGroup {
    group: FilterGroupId,
    #[serde(skip)]
    filter: Arc<Filter>,
    label: String,
}

impl FilterGroup {
    pub fn new(group: FilterGroupId, filter: Arc<Filter>, label: String) -> Self {
        Self {
            group,
            filter,
            label,
        }
    }
    pub fn group(&self) -> FilterGroupId {
        self.group
    }
    pub fn filter(&self) -> Arc<Filter> {
        Arc::clone(&self.filter)
    }
    pub fn label(&self) -> &str {
        &self.label
    }
}
impl PartialEq for FilterGroup {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
    }
}
impl Hash for FilterGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
    }
}

// ------------- FilterItem -------------
#[derive(Eq, Debug, Serialize)]
pub struct FilterItem {
    item: FilterItemId,
    #[serde(skip)]
    group: Arc<FilterGroup>,
    label: String,
}

impl FilterItem {
    pub fn new(item: FilterItemId, group: Arc<FilterGroup>, label: String) -> Self {
        Self { item, group, label }
    }
    pub fn item(&self) -> FilterItemId {
        self.item
    }
    pub fn group(&self) -> Arc<FilterGroup> {
        Arc::clone(&self.group)
    }
    pub fn filter(&self) -> Arc<Filter> {
        self.group.filter()
    }
    /// The Subject owning this item through its group and filter.
    pub fn subject(&self) -> SubjectId {
        self.group.filter.subject
    }
    pub fn label(&self) -> &str {
        &self.label
    }
}
impl Ord for FilterItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item.cmp(&other.item)
    }
}
impl PartialOrd for FilterItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for FilterItem {
    fn eq(&self, other: &Self) -> bool {
        self.item == other.item
    }
}
impl Hash for FilterItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.item.hash(state);
    }
}
impl fmt::Display for FilterItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{} / {}]",
            self.label,
            self.group.filter.label,
            self.group.label
        )
    }
}

// ------------- Keepers -------------
// Hydration sees the same filter and group once per item, the keepers make
// sure every item shares a single Arc of each.
#[derive(Debug, Default)]
pub struct FilterKeeper {
    kept: HashMap<FilterId, Arc<Filter>, ThingHasher>,
}
impl FilterKeeper {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn keep(&mut self, filter: Filter) -> (Arc<Filter>, bool) {
        match self.kept.entry(filter.filter()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), true),
            Entry::Vacant(e) => (Arc::clone(e.insert(Arc::new(filter))), false),
        }
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct FilterGroupKeeper {
    kept: HashMap<FilterGroupId, Arc<FilterGroup>, ThingHasher>,
}
impl FilterGroupKeeper {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn keep(&mut self, group: FilterGroup) -> (Arc<FilterGroup>, bool) {
        match self.kept.entry(group.group()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), true),
            Entry::Vacant(e) => (Arc::clone(e.insert(Arc::new(group))), false),
        }
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

// ------------- CandidateSet -------------
/// The filter items that remain selectable, ordered by identity.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CandidateSet {
    items: Vec<Arc<FilterItem>>,
}

/// One filter with its groups and candidate items, ordered for display.
#[derive(Debug, Serialize)]
pub struct FilterOptions {
    pub filter: Arc<Filter>,
    pub groups: Vec<GroupOptions>,
}

#[derive(Debug, Serialize)]
pub struct GroupOptions {
    pub group: Arc<FilterGroup>,
    pub items: Vec<Arc<FilterItem>>,
}

impl CandidateSet {
    pub fn empty() -> Self {
        Self::default()
    }
    pub(crate) fn from_items(mut items: Vec<Arc<FilterItem>>) -> Self {
        items.sort_unstable();
        items.dedup();
        Self { items }
    }
    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<FilterItem>> {
        self.items.iter()
    }
    pub fn contains(&self, item: FilterItemId) -> bool {
        self.items
            .binary_search_by(|kept| kept.item().cmp(&item))
            .is_ok()
    }
    pub fn ids(&self) -> RoaringTreemap {
        self.items.iter().map(|item| item.item()).collect()
    }
    pub fn labels(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.label()).collect()
    }
    /// Groups the candidates Filter -> FilterGroup -> items, each level ordered by label.
    pub fn options(&self) -> Vec<FilterOptions> {
        let mut by_group: HashMap<FilterGroupId, Vec<Arc<FilterItem>>, ThingHasher> =
            HashMap::default();
        for item in &self.items {
            by_group
                .entry(item.group().group())
                .or_default()
                .push(Arc::clone(item));
        }
        let mut by_filter: HashMap<FilterId, Vec<GroupOptions>, ThingHasher> = HashMap::default();
        let mut filters: Vec<Arc<Filter>> = Vec::new();
        for (_, mut items) in by_group {
            items.sort_by(|a, b| a.label().cmp(b.label()).then(a.item().cmp(&b.item())));
            let group = items[0].group();
            let filter = group.filter();
            let groups = by_filter.entry(filter.filter()).or_default();
            if groups.is_empty() {
                filters.push(filter);
            }
            groups.push(GroupOptions { group, items });
        }
        filters.sort_by(|a, b| a.label().cmp(b.label()).then(a.filter().cmp(&b.filter())));
        filters
            .into_iter()
            .map(|filter| {
                let mut groups = by_filter.remove(&filter.filter()).unwrap_or_default();
                groups.sort_by(|a, b| {
                    a.group
                        .label()
                        .cmp(b.group.label())
                        .then(a.group.group().cmp(&b.group.group()))
                });
                FilterOptions { filter, groups }
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a CandidateSet {
    type Item = &'a Arc<FilterItem>;
    type IntoIter = std::slice::Iter<'a, Arc<FilterItem>>;
    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// ------------- Matched observations -------------
lazy_static::lazy_static! {
    static ref RELATION_NAME: Regex =
        Regex::new(r"^(?:(?:temp|main)\.)?[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// A validated name of a relation holding observation identities in an `Id` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationName(String);

impl RelationName {
    pub fn new(name: &str) -> Result<Self> {
        if RELATION_NAME.is_match(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(CandidateError::InvalidRelation(name.to_string()))
        }
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the matched observation identities live.
#[derive(Debug, Clone)]
pub enum ObservationSetRef {
    /// Identities held in memory, materialized by the engine when needed.
    Ids(RoaringTreemap),
    /// A relation the caller already populated on the same session.
    Relation(RelationName),
}

/// The observations already narrowed by location and time-period choices.
#[derive(Debug, Clone)]
pub enum MatchedObservations {
    /// No location or time-period choice has been made yet.
    Unconstrained,
    Bounded { count: u64, source: ObservationSetRef },
}

impl MatchedObservations {
    pub fn from_ids(ids: RoaringTreemap) -> Self {
        MatchedObservations::Bounded {
            count: ids.len(),
            source: ObservationSetRef::Ids(ids),
        }
    }
    pub fn from_relation(name: &str, count: u64) -> Result<Self> {
        Ok(MatchedObservations::Bounded {
            count,
            source: ObservationSetRef::Relation(RelationName::new(name)?),
        })
    }
    /// `None` when unconstrained.
    pub fn count(&self) -> Option<u64> {
        match self {
            MatchedObservations::Unconstrained => None,
            MatchedObservations::Bounded { count, .. } => Some(*count),
        }
    }
}
