//! Source tuple schemas

use serde::{Deserialize, Serialize};

/// Declared shape of one source tuple type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<String>,
    /// Fields the source is partitioned by, if any.
    #[serde(default)]
    pub partition_fields: Option<Vec<String>>,
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(String::from).collect(),
            partition_fields: None,
        }
    }

    pub fn with_partition_fields(mut self, fields: Vec<&str>) -> Self {
        self.partition_fields = Some(fields.into_iter().map(String::from).collect());
        self
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}
