//! Partial updates: field sets and element-level collection operations.
//!
//! An update touches only the fields it names. Collection operations are
//! expressed as an incoming collection state with no put of its own
//! (top-level timestamp 0), so they merge element by element.

use crate::timestamp::{CollectionRmdTimestamp, FieldTimestamps, RmdRecord, NO_COLO_ID};
use crate::value::{Record, Value};

#[derive(Debug, Clone, PartialEq)]
enum FieldOp {
    Set(Value),
    PutCollection(Value),
    List {
        add: Vec<Value>,
        remove: Vec<Value>,
    },
    Map {
        put: Vec<(String, Value)>,
        remove: Vec<String>,
    },
}

/// Builder for a partial update written at one logical timestamp.
///
/// # Example
///
/// ```
/// use rmd_core::{UpdateBuilder, Value};
///
/// let (value, rmd) = UpdateBuilder::new(12)
///     .set_field("Age", 44)
///     .add_to_list("Items", vec![Value::from("z")])
///     .build(3)
///     .unwrap();
/// assert_eq!(value.get("Age"), Some(&Value::Int(44)));
/// assert_eq!(rmd.max_timestamp(), 12);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBuilder {
    timestamp: i64,
    ops: Vec<(String, FieldOp)>,
}

impl UpdateBuilder {
    /// Start an update at `timestamp`.
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            ops: Vec::new(),
        }
    }

    /// Timestamp of every operation in this update.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Overwrite a non-collection field.
    #[must_use]
    pub fn set_field(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.replace(field.into(), FieldOp::Set(value.into()))
    }

    /// Overwrite a whole list or map field.
    #[must_use]
    pub fn put_collection(self, field: impl Into<String>, value: Value) -> Self {
        self.replace(field.into(), FieldOp::PutCollection(value))
    }

    /// Add elements to a list field.
    #[must_use]
    pub fn add_to_list(mut self, field: impl Into<String>, elements: Vec<Value>) -> Self {
        let slot = self.slot(field.into(), || FieldOp::List {
            add: Vec::new(),
            remove: Vec::new(),
        });
        match slot {
            FieldOp::List { add, .. } => add.extend(elements),
            other => *other = FieldOp::List {
                add: elements,
                remove: Vec::new(),
            },
        }
        self
    }

    /// Remove elements from a list field.
    #[must_use]
    pub fn remove_from_list(mut self, field: impl Into<String>, elements: Vec<Value>) -> Self {
        let slot = self.slot(field.into(), || FieldOp::List {
            add: Vec::new(),
            remove: Vec::new(),
        });
        match slot {
            FieldOp::List { remove, .. } => remove.extend(elements),
            other => *other = FieldOp::List {
                add: Vec::new(),
                remove: elements,
            },
        }
        self
    }

    /// Put entries into a map field.
    #[must_use]
    pub fn put_map_entries(
        mut self,
        field: impl Into<String>,
        entries: Vec<(String, Value)>,
    ) -> Self {
        let slot = self.slot(field.into(), || FieldOp::Map {
            put: Vec::new(),
            remove: Vec::new(),
        });
        match slot {
            FieldOp::Map { put, .. } => put.extend(entries),
            other => *other = FieldOp::Map {
                put: entries,
                remove: Vec::new(),
            },
        }
        self
    }

    /// Remove keys from a map field.
    #[must_use]
    pub fn remove_map_keys(mut self, field: impl Into<String>, keys: Vec<String>) -> Self {
        let slot = self.slot(field.into(), || FieldOp::Map {
            put: Vec::new(),
            remove: Vec::new(),
        });
        match slot {
            FieldOp::Map { remove, .. } => remove.extend(keys),
            other => *other = FieldOp::Map {
                put: Vec::new(),
                remove: keys,
            },
        }
        self
    }

    /// Produce the partial value and its per-field RMD.
    ///
    /// `colo_id` is recorded as the putter of any whole-collection put.
    ///
    /// # Errors
    ///
    /// Returns error if one operation both adds and removes an element.
    pub fn build(self, colo_id: i32) -> Result<(Record, RmdRecord), UpdateError> {
        let ts = self.timestamp;
        let mut value = Record::new();
        let mut timestamps = FieldTimestamps::new();

        for (field, op) in self.ops {
            match op {
                FieldOp::Set(v) => {
                    value.set(field.clone(), v);
                    timestamps.set(field, ts.into());
                }
                FieldOp::PutCollection(v) => {
                    let len = v.collection_len().unwrap_or(0);
                    let len = i32::try_from(len).map_err(|_| UpdateError::TooLarge {
                        field: field.clone(),
                    })?;
                    value.set(field.clone(), v);
                    timestamps.set(field, CollectionRmdTimestamp::put(ts, colo_id, len).into());
                }
                FieldOp::List { add, remove } => {
                    let add = dedup(add);
                    let remove = dedup(remove);
                    if add.iter().any(|a| remove.contains(a)) {
                        return Err(UpdateError::AddAndRemove { field });
                    }
                    timestamps.set(field.clone(), element_ops(ts, add.len(), remove).into());
                    value.set(field, Value::Array(add));
                }
                FieldOp::Map { put, remove } => {
                    let mut entries: Vec<(String, Value)> = Vec::with_capacity(put.len());
                    for (key, v) in put {
                        match entries.iter_mut().find(|(k, _)| *k == key) {
                            Some(slot) => slot.1 = v,
                            None => entries.push((key, v)),
                        }
                    }
                    let remove = dedup(remove.into_iter().map(Value::String).collect());
                    if entries
                        .iter()
                        .any(|(k, _)| remove.iter().any(|r| matches!(r, Value::String(s) if s == k)))
                    {
                        return Err(UpdateError::AddAndRemove { field });
                    }
                    timestamps.set(field.clone(), element_ops(ts, entries.len(), remove).into());
                    value.set(field, Value::Map(entries));
                }
            }
        }

        Ok((value, RmdRecord::per_field(timestamps)))
    }

    fn replace(mut self, field: String, op: FieldOp) -> Self {
        *self.slot(field, || FieldOp::Set(Value::Null)) = op;
        self
    }

    fn slot(&mut self, field: String, init: impl FnOnce() -> FieldOp) -> &mut FieldOp {
        let idx = match self.ops.iter().position(|(name, _)| *name == field) {
            Some(idx) => idx,
            None => {
                self.ops.push((field, init()));
                self.ops.len() - 1
            }
        };
        &mut self.ops[idx].1
    }
}

fn dedup(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Timestamps for element-level operations: no put, every element active.
fn element_ops(ts: i64, added: usize, removed: Vec<Value>) -> CollectionRmdTimestamp {
    CollectionRmdTimestamp {
        active_elements_timestamps: vec![ts; added],
        deleted_elements_timestamps: vec![ts; removed.len()],
        deleted_elements: removed,
        ..CollectionRmdTimestamp::put(0, NO_COLO_ID, 0)
    }
}

/// Errors raised while building an update.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// The same element is both added and removed
    #[error("field {field} adds and removes the same element")]
    AddAndRemove {
        /// Offending field
        field: String,
    },
    /// Collection longer than the put-only length can describe
    #[error("collection in field {field} is too large")]
    TooLarge {
        /// Offending field
        field: String,
    },
}

impl UpdateError {
    /// The field the error refers to.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            UpdateError::AddAndRemove { field } | UpdateError::TooLarge { field } => field,
        }
    }
}
