use crate::catalog::types::{Fields, Record, Value};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Field excluded from composite identity keys unless the schema says otherwise.
pub const DEFAULT_METADATA_FIELD: &str = "__typename";
pub const DEFAULT_CREATED_AT_FIELD: &str = "created_at";

/// Per-table description of how records are identified and ordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub table_id: CompactString,
    /// Designated unique field. Records without it fall back to a composite key.
    #[serde(default)]
    pub unique_field: Option<CompactString>,
    /// Transport metadata fields that never take part in a composite key.
    #[serde(default = "default_metadata_fields")]
    pub metadata_fields: BTreeSet<CompactString>,
    #[serde(default = "default_created_at_field")]
    pub created_at_field: Option<CompactString>,
}

fn default_metadata_fields() -> BTreeSet<CompactString> {
    BTreeSet::from([CompactString::from(DEFAULT_METADATA_FIELD)])
}

fn default_created_at_field() -> Option<CompactString> {
    Some(DEFAULT_CREATED_AT_FIELD.into())
}

impl TableSchema {
    pub fn new(table_id: impl Into<CompactString>) -> Self {
        Self {
            table_id: table_id.into(),
            unique_field: None,
            metadata_fields: default_metadata_fields(),
            created_at_field: default_created_at_field(),
        }
    }

    pub fn with_unique_field(mut self, field: impl Into<CompactString>) -> Self {
        self.unique_field = Some(field.into());
        self
    }

    pub fn with_metadata_field(mut self, field: impl Into<CompactString>) -> Self {
        self.metadata_fields.insert(field.into());
        self
    }

    pub fn with_created_at_field(mut self, field: Option<&str>) -> Self {
        self.created_at_field = field.map(CompactString::from);
        self
    }

    pub fn is_metadata(&self, field: &str) -> bool {
        self.metadata_fields.contains(field)
    }

    /// Classifies raw fields into the record variant this table uses. A null
    /// or missing unique field degrades to a composite-keyed record.
    pub fn record(&self, fields: Fields) -> Record {
        let key = self
            .unique_field
            .as_deref()
            .and_then(|name| fields.get(name))
            .filter(|value| !value.is_null())
            .map(Value::render);
        match key {
            Some(key) => Record::UniquelyKeyed { key, fields },
            None => Record::CompositeKeyed { fields },
        }
    }

    pub fn created_at<'a>(&self, record: &'a Record) -> Option<&'a Value> {
        self.created_at_field
            .as_deref()
            .and_then(|name| record.get(name))
            .filter(|value| !value.is_null())
    }
}
