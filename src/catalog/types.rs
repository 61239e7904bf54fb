use crate::error::SyncError;
use crate::identity::IdentityKey;
use compact_str::{CompactString, ToCompactString};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
    Json(CompactString),
    Null,
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Float(_) => 4,
            Value::Text(_) => 5,
            Value::Json(_) => 6,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical textual form used when a value takes part in an identity key.
    pub fn render(&self) -> CompactString {
        match self {
            Value::Text(s) | Value::Json(s) => s.clone(),
            Value::Integer(v) | Value::Timestamp(v) => v.to_compact_string(),
            Value::Float(v) => v.to_compact_string(),
            Value::Boolean(v) => v.to_compact_string(),
            Value::Null => CompactString::from("null"),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s.into()),
            other => Value::Json(other.to_string().into()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

/// Field name to value mapping that preserves insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields {
    entries: Vec<(CompactString, Value)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, name: impl Into<CompactString>, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(field, _)| *field == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<CompactString>, value: impl Into<Value>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(field, _)| field == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Overlays `other` onto `self`; fields present in both take `other`'s value.
    pub fn merge(&mut self, other: &Fields) {
        for (name, value) in &other.entries {
            self.set(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CompactString, &Value)> {
        self.entries.iter().map(|(name, value)| (name, value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Builds fields from a JSON object as delivered by the transport.
    pub fn from_json(value: serde_json::Value) -> Result<Self, SyncError> {
        match value {
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(name, value)| (CompactString::from(name), Value::from_json(value)))
                .collect()),
            other => Err(SyncError::Validation(format!(
                "record payload must be a JSON object, got {other}"
            ))),
        }
    }
}

impl FromIterator<(CompactString, Value)> for Fields {
    fn from_iter<T: IntoIterator<Item = (CompactString, Value)>>(iter: T) -> Self {
        let mut fields = Fields::new();
        for (name, value) in iter {
            fields.set(name, value);
        }
        fields
    }
}

/// One row of a table. Tables whose schema declares a unique field produce
/// `UniquelyKeyed` records; everything else is identified by its full field set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    UniquelyKeyed { key: CompactString, fields: Fields },
    CompositeKeyed { fields: Fields },
}

impl Record {
    pub fn fields(&self) -> &Fields {
        match self {
            Record::UniquelyKeyed { fields, .. } | Record::CompositeKeyed { fields } => fields,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields().get(name)
    }

    /// Merges a partial record in place. The identity of a uniquely keyed
    /// record is fixed for the session, so the stored key is left untouched.
    pub fn merge(&mut self, partial: &Fields) {
        match self {
            Record::UniquelyKeyed { fields, .. } | Record::CompositeKeyed { fields } => {
                fields.merge(partial)
            }
        }
    }
}

/// A raw out-of-band mutation as delivered by the transport, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    Add { record: Record },
    Update { key: IdentityKey, partial: Fields },
    Delete { key: IdentityKey },
}

impl MutationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MutationEvent::Add { .. } => "add",
            MutationEvent::Update { .. } => "update",
            MutationEvent::Delete { .. } => "delete",
        }
    }
}
