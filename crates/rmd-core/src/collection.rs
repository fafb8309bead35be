//! Conflict resolution for list and map fields.
//!
//! A collection field behaves like an observed-remove set layered under a
//! last-writer-wins whole-collection put:
//!
//! - The put with the higher `(top_level_timestamp, top_level_colo_id)`
//!   supersedes everything the other side wrote at or before its timestamp.
//! - Elements are matched by identity (map key, or list value) and carry
//!   their own timestamps; the later write of an element wins.
//! - Removed elements leave a tombstone. An element survives only when it is
//!   strictly newer than its tombstone, and a surviving element clears it.
//!
//! The functions here are pure: inputs are borrowed, a new collection value
//! and a new [`CollectionRmdTimestamp`] are returned.

use crate::config::TombstonePolicy;
use crate::timestamp::{CollectionRmdTimestamp, TimestampError};
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// One side of a collection merge.
#[derive(Debug, Clone, Copy)]
pub struct CollectionSide<'a> {
    /// Collection value: an array, a map, or null for a nullable field
    pub value: &'a Value,
    /// Timestamps describing `value`
    pub rmd: &'a CollectionRmdTimestamp,
}

impl<'a> CollectionSide<'a> {
    /// Pair a collection value with its timestamps.
    #[must_use]
    pub fn new(value: &'a Value, rmd: &'a CollectionRmdTimestamp) -> Self {
        Self { value, rmd }
    }
}

/// Result of merging two collection states.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCollection {
    /// New collection value
    pub value: Value,
    /// New timestamps, consistent with `value`
    pub rmd: CollectionRmdTimestamp,
    /// Whether the incoming side changed anything
    pub incoming_won: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    List,
    Map,
}

/// Element identity ordered by [`Value::total_cmp`].
#[derive(Debug, Clone)]
struct ElementKey(Value);

impl PartialEq for ElementKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ElementKey {}

impl PartialOrd for ElementKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ElementKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone)]
struct Element {
    /// Map value; `None` for list elements
    payload: Option<Value>,
    timestamp: i64,
    /// Position inside the put-only prefix of a winning put
    put_position: Option<usize>,
    from_incoming: bool,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    timestamp: i64,
    from_incoming: bool,
}

fn kind_of(value: &Value) -> Result<Option<Kind>, CollectionError> {
    match value {
        Value::Array(_) => Ok(Some(Kind::List)),
        Value::Map(_) => Ok(Some(Kind::Map)),
        Value::Null => Ok(None),
        other => Err(CollectionError::NotACollection(other.kind())),
    }
}

/// Expand one side into `(identity, element)` pairs, first occurrence wins.
fn expand(
    side: CollectionSide<'_>,
    from_incoming: bool,
) -> Result<Vec<(ElementKey, Element)>, CollectionError> {
    let len = side.value.collection_len().unwrap_or(0);
    let timestamps = side.rmd.element_timestamps(len)?;
    let put_only = len - side.rmd.active_elements_timestamps.len();

    let entries: Vec<(Value, Option<Value>)> = match side.value {
        Value::Array(items) => items.iter().map(|v| (v.clone(), None)).collect(),
        Value::Map(entries) => entries
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), Some(v.clone())))
            .collect(),
        _ => Vec::new(),
    };

    let mut seen = BTreeSet::new();
    let mut expanded = Vec::with_capacity(entries.len());
    for (idx, ((identity, payload), timestamp)) in entries.into_iter().zip(timestamps).enumerate() {
        let key = ElementKey(identity);
        if !seen.insert(key.clone()) {
            continue;
        }
        expanded.push((
            key,
            Element {
                payload,
                timestamp,
                put_position: (idx < put_only).then_some(idx),
                from_incoming,
            },
        ));
    }
    Ok(expanded)
}

/// Choose between two writes of the same element.
fn pick(current: Element, candidate: Element) -> Element {
    let order = candidate.timestamp.cmp(&current.timestamp).then_with(|| {
        match (&candidate.payload, &current.payload) {
            (Some(a), Some(b)) => a.total_cmp(b),
            _ => Ordering::Equal,
        }
    });
    match order {
        Ordering::Greater => candidate,
        Ordering::Less => current,
        Ordering::Equal => {
            let put_position = match (current.put_position, candidate.put_position) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            Element {
                put_position,
                ..current
            }
        }
    }
}

/// Merge an existing collection state with an incoming one.
///
/// # Errors
///
/// Returns error if either side is not a collection, the sides are of
/// different kinds, or a side violates the timestamp invariants.
pub fn merge_collections(
    existing: CollectionSide<'_>,
    incoming: CollectionSide<'_>,
    policy: &TombstonePolicy,
) -> Result<MergedCollection, CollectionError> {
    let kind = match (kind_of(existing.value)?, kind_of(incoming.value)?) {
        (Some(a), Some(b)) if a != b => {
            return Err(CollectionError::KindMismatch {
                existing: existing.value.kind(),
                incoming: incoming.value.kind(),
            })
        }
        (a, b) => a.or(b),
    };

    let existing_elements = expand(existing, false)?;
    let incoming_elements = expand(incoming, true)?;

    let top_order = (
        incoming.rmd.top_level_timestamp,
        incoming.rmd.top_level_colo_id,
    )
        .cmp(&(
            existing.rmd.top_level_timestamp,
            existing.rmd.top_level_colo_id,
        ));
    let (existing_wins_top, incoming_wins_top) = match top_order {
        Ordering::Greater => (false, true),
        Ordering::Less => (true, false),
        Ordering::Equal => (true, true),
    };
    let top_source = if existing_wins_top { existing } else { incoming };
    let top_ts = top_source.rmd.top_level_timestamp;
    let top_colo = top_source.rmd.top_level_colo_id;

    let existing_keys: Vec<ElementKey> = existing_elements.iter().map(|(k, _)| k.clone()).collect();
    let position_offset = existing_elements.len();

    let mut elements: BTreeMap<ElementKey, Element> = BTreeMap::new();
    let sides = [
        (existing_wins_top, existing_elements, 0),
        (incoming_wins_top, incoming_elements, position_offset),
    ];
    for (wins_top, side_elements, offset) in sides {
        for (key, mut element) in side_elements {
            if wins_top {
                element.put_position = element.put_position.map(|p| p + offset);
            } else {
                // Superseded by the other side's put
                if element.timestamp <= top_ts {
                    continue;
                }
                element.put_position = None;
            }
            match elements.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(element);
                }
                Entry::Occupied(mut slot) => {
                    let current = slot.get().clone();
                    slot.insert(pick(current, element));
                }
            }
        }
    }

    let mut tombstones: BTreeMap<ElementKey, Tombstone> = BTreeMap::new();
    for (side, from_incoming) in [(existing, false), (incoming, true)] {
        for (element, timestamp) in side.rmd.tombstones() {
            let candidate = Tombstone {
                timestamp,
                from_incoming,
            };
            tombstones
                .entry(ElementKey(element.clone()))
                .and_modify(|t| {
                    if timestamp > t.timestamp {
                        *t = candidate;
                    }
                })
                .or_insert(candidate);
        }
    }
    // The winning put already supersedes anything older
    tombstones.retain(|_, t| t.timestamp >= top_ts);

    elements.retain(|key, element| match tombstones.get(key) {
        Some(t) => element.timestamp > t.timestamp,
        None => true,
    });
    for key in elements.keys() {
        tombstones.remove(key);
    }

    let newest = elements
        .values()
        .map(|e| e.timestamp)
        .chain(tombstones.values().map(|t| t.timestamp))
        .fold(top_ts, i64::max);
    prune_tombstones(&mut tombstones, newest, policy);

    let incoming_won = (incoming_wins_top && !existing_wins_top)
        || elements.values().any(|e| e.from_incoming)
        || tombstones.values().any(|t| t.from_incoming)
        || existing_keys.iter().any(|k| !elements.contains_key(k));

    let (mut prefix, mut rest): (Vec<_>, Vec<_>) = elements
        .into_iter()
        .partition(|(_, e)| e.put_position.is_some() && e.timestamp == top_ts);
    prefix.sort_by_key(|(_, e)| e.put_position);
    rest.sort_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)));

    let null_put = match (existing_wins_top, incoming_wins_top) {
        (true, false) => *existing.value == Value::Null,
        (false, true) => *incoming.value == Value::Null,
        _ => *existing.value == Value::Null && *incoming.value == Value::Null,
    };

    let ordered: Vec<(ElementKey, Element)> = prefix.iter().cloned().chain(rest.iter().cloned()).collect();
    let value = match kind {
        _ if ordered.is_empty() && null_put => Value::Null,
        Some(Kind::Map) => Value::Map(
            ordered
                .into_iter()
                .map(|(key, e)| match key.0 {
                    Value::String(k) => Ok((k, e.payload.unwrap_or(Value::Null))),
                    other => Err(CollectionError::NotACollection(other.kind())),
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(Kind::List) => Value::Array(ordered.into_iter().map(|(key, _)| key.0).collect()),
        None => Value::Null,
    };

    let mut deleted: Vec<(ElementKey, i64)> = tombstones
        .into_iter()
        .map(|(k, t)| (k, t.timestamp))
        .collect();
    deleted.sort_by(|(ka, a), (kb, b)| a.cmp(b).then_with(|| ka.cmp(kb)));

    let put_only_part_length = i32::try_from(prefix.len()).map_err(|_| CollectionError::TooLarge)?;
    let rmd = CollectionRmdTimestamp {
        top_level_timestamp: top_ts,
        top_level_colo_id: top_colo,
        put_only_part_length,
        active_elements_timestamps: rest.iter().map(|(_, e)| e.timestamp).collect(),
        deleted_elements_timestamps: deleted.iter().map(|(_, ts)| *ts).collect(),
        deleted_elements: deleted.into_iter().map(|(k, _)| k.0).collect(),
    };

    Ok(MergedCollection {
        value,
        rmd,
        incoming_won,
    })
}

fn prune_tombstones(
    tombstones: &mut BTreeMap<ElementKey, Tombstone>,
    newest: i64,
    policy: &TombstonePolicy,
) {
    let before = tombstones.len();
    if let Some(horizon) = policy.horizon_ms {
        let cutoff = newest.saturating_sub(horizon);
        tombstones.retain(|_, t| t.timestamp >= cutoff);
    }
    if let Some(max) = policy.max_tombstones {
        if tombstones.len() > max {
            let mut by_age: Vec<(ElementKey, i64)> = tombstones
                .iter()
                .map(|(k, t)| (k.clone(), t.timestamp))
                .collect();
            by_age.sort_by(|(ka, a), (kb, b)| b.cmp(a).then_with(|| ka.cmp(kb)));
            for (key, _) in by_age.into_iter().skip(max) {
                tombstones.remove(&key);
            }
        }
    }
    let pruned = before - tombstones.len();
    if pruned > 0 {
        tracing::trace!(pruned, newest, "Pruned collection tombstones");
    }
}

/// Errors raised while merging collections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    /// Value paired with collection timestamps is not a collection
    #[error("collection timestamps paired with a {0} value")]
    NotACollection(&'static str),
    /// One side is a list and the other a map
    #[error("cannot merge {existing} with {incoming}")]
    KindMismatch {
        /// Existing value kind
        existing: &'static str,
        /// Incoming value kind
        incoming: &'static str,
    },
    /// Timestamps inconsistent with the value
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    /// Collection longer than the put-only length can describe
    #[error("collection too large")]
    TooLarge,
}
