use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Fields, Record};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Identity assigned to records from which no key can be derived. Never
/// coalesced with anything, including another sentinel-keyed record.
pub const UNKNOWN_IDENTITY: &str = "unknown";
/// Joins a field name to its rendered value inside a composite key.
pub const FIELD_VALUE_SEPARATOR: char = ':';
/// Joins `name:value` pairs inside a composite key.
pub const PAIR_SEPARATOR: char = '|';

/// Stable identity of a logical row for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(CompactString);

impl IdentityKey {
    pub fn new(key: impl Into<CompactString>) -> Self {
        Self(key.into())
    }

    pub fn unknown() -> Self {
        Self(CompactString::from(UNKNOWN_IDENTITY))
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_IDENTITY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<CompactString> for IdentityKey {
    fn from(value: CompactString) -> Self {
        Self(value)
    }
}

/// Computes the identity key of a record. Pure and total: records that
/// carry nothing to key on resolve to [`UNKNOWN_IDENTITY`].
pub fn identity_key(schema: &TableSchema, record: &Record) -> IdentityKey {
    match record {
        Record::UniquelyKeyed { key, .. } => IdentityKey::new(key.clone()),
        Record::CompositeKeyed { fields } => composite_key(schema, fields),
    }
}

/// Composite identity built from every non-metadata field, sorted by name so
/// that field insertion order never affects the result.
pub fn composite_key(schema: &TableSchema, fields: &Fields) -> IdentityKey {
    let mut pairs: SmallVec<[(&str, CompactString); 16]> = fields
        .iter()
        .filter(|(name, _)| !schema.is_metadata(name))
        .map(|(name, value)| (name.as_str(), value.render()))
        .collect();
    if pairs.is_empty() {
        return IdentityKey::unknown();
    }
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut key = CompactString::default();
    for (i, (name, value)) in pairs.iter().enumerate() {
        if i > 0 {
            key.push(PAIR_SEPARATOR);
        }
        key.push_str(name);
        key.push(FIELD_VALUE_SEPARATOR);
        key.push_str(value);
    }
    IdentityKey(key)
}
