//! Mapping definitions: sources, target, query logic and rule overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_connectors::RuleSet;

/// A source table read by a mapping, under an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub table: String,

    /// Name the logic uses for this source. Defaults to the table id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl SourceRef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
        }
    }

    pub fn aliased(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

/// Equi-join attaching `source` to the sources joined before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Alias of the source being attached.
    pub source: String,

    #[serde(default)]
    pub kind: JoinKind,

    /// `alias.column` on an already joined source.
    pub left: String,

    /// `alias.column` on `source`.
    pub right: String,
}

/// Declarative join/filter/projection over the mapping's sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingLogic {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<Join>,

    /// Boolean predicate over the aliased rows, e.g. `o.amount > 100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Output column to expression. Empty passes the first source through.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub select: BTreeMap<String, String>,
}

/// Moves rows from one or more sources into exactly one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: String,
    pub sources: Vec<SourceRef>,
    pub target: String,

    #[serde(default)]
    pub logic: MappingLogic,

    #[serde(default)]
    pub overrides: RuleSet,
}

impl Mapping {
    /// Table ids this mapping reads.
    pub fn source_tables(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.table.as_str())
    }
}

/// Split `alias.column`.
pub fn split_qualified(expr: &str) -> Option<(&str, &str)> {
    let (alias, column) = expr.trim().split_once('.')?;
    if alias.is_empty() || column.is_empty() || column.contains('.') {
        return None;
    }
    Some((alias, column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_deserialization() {
        let yaml = r#"
id: enrich_orders
sources:
  - table: raw_orders
    alias: o
  - table: customers
    alias: c
target: orders
logic:
  joins:
    - source: c
      kind: left
      left: o.customer_id
      right: c.id
  filter: "o.amount > {{ min_amount }}"
  select:
    id: o.id
    customer: c.name
overrides:
  updated_at: source.o.modified_ts
"#;
        let mapping: Mapping = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(mapping.sources[0].alias(), "o");
        assert_eq!(mapping.logic.joins[0].kind, JoinKind::Left);
        assert_eq!(mapping.logic.select.len(), 2);
        assert_eq!(mapping.source_tables().collect::<Vec<_>>(), vec!["raw_orders", "customers"]);
    }

    #[test]
    fn test_alias_defaults_to_table() {
        assert_eq!(SourceRef::new("raw_orders").alias(), "raw_orders");
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("o.id"), Some(("o", "id")));
        assert_eq!(split_qualified("id"), None);
        assert_eq!(split_qualified("a.b.c"), None);
        assert_eq!(split_qualified(".id"), None);
    }
}
