//! Table definitions.

use serde::{Deserialize, Serialize};
use tessera_connectors::{Location, RuleSet};

/// Whether a table is read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Source,
    Target,
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    /// Informational type name.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
            nullable: true,
        }
    }
}

/// A source or target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: String,
    pub kind: TableKind,

    #[serde(default)]
    pub schema: Vec<Column>,

    /// Rules applied on every write unless a mapping overrides them.
    #[serde(default)]
    pub default_rules: RuleSet,

    pub location: Location,
}

impl Table {
    pub fn has_column(&self, name: &str) -> bool {
        self.schema.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.schema.iter().map(|c| c.name.as_str())
    }

    /// Rule columns that are not part of the schema.
    pub fn unknown_rule_columns<'a>(&self, rules: &'a RuleSet) -> Vec<&'a str> {
        rules
            .keys()
            .filter(|column| !self.has_column(column))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_connectors::RuleExpr;

    #[test]
    fn test_table_deserialization() {
        let yaml = r#"
id: orders
kind: target
schema:
  - name: id
    type: bigint
    nullable: false
  - name: updated_at
default_rules:
  updated_at: now
location:
  connection: warehouse
  path: mart.orders
"#;
        let table: Table = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.kind, TableKind::Target);
        assert_eq!(table.schema.len(), 2);
        assert!(!table.schema[0].nullable);
        assert!(table.schema[1].nullable);
        assert_eq!(table.default_rules["updated_at"], RuleExpr::from("now"));
        assert_eq!(table.location.path, "mart.orders");
    }

    #[test]
    fn test_unknown_rule_columns() {
        let table = Table {
            id: "orders".to_string(),
            kind: TableKind::Target,
            schema: vec![Column::new("id"), Column::new("updated_at")],
            default_rules: RuleSet::new(),
            location: Location::new("warehouse", "orders"),
        };
        let mut rules = RuleSet::new();
        rules.insert("updated_at".to_string(), RuleExpr::from("now"));
        rules.insert("loaded_by".to_string(), RuleExpr::from("'etl'"));
        assert_eq!(table.unknown_rule_columns(&rules), vec!["loaded_by"]);
    }
}
