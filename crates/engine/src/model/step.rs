//! Steps: a mapping plus run-time parameter bindings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A reusable unit of work. The same step may appear in several flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub mapping: String,

    /// Values substituted into the mapping's logic templates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Steps that must finish first, beyond table-inferred dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, mapping: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mapping: mapping.into(),
            params: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }
}
