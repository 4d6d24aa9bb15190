//! Update rules and their evaluation at write time.
//!
//! Rule expressions are opaque strings everywhere except here. Supported
//! forms:
//!
//! - `now` / `now()`: the write-time timestamp (RFC 3339, one per write call)
//! - `null`
//! - `default`: leave the column out so the store default applies
//! - `source.<col>` or `source.<alias>.<col>`: value from the source record
//! - `'text'` / `"text"`, numbers, `true` / `false`: literals
//! - `<col>`: value of another output column, as produced by the mapping

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConnectorError;
use crate::row::{Row, WriteRecord};

/// An opaque rule expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleExpr(pub String);

impl RuleExpr {
    pub fn new(expr: impl Into<String>) -> Self {
        Self(expr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RuleExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleExpr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Column name to rule expression.
pub type RuleSet = BTreeMap<String, RuleExpr>;

/// Parsed form of a rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Now,
    Null,
    StoreDefault,
    Source(Vec<String>),
    Column(String),
    Literal(serde_json::Value),
}

impl Rule {
    /// Parse a rule expression.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty rule".to_string());
        }

        match expr.to_ascii_lowercase().as_str() {
            "now" | "now()" | "current_timestamp" => return Ok(Rule::Now),
            "null" => return Ok(Rule::Null),
            "default" => return Ok(Rule::StoreDefault),
            "true" => return Ok(Rule::Literal(serde_json::Value::Bool(true))),
            "false" => return Ok(Rule::Literal(serde_json::Value::Bool(false))),
            _ => {}
        }

        if let Some(text) = quoted(expr) {
            return Ok(Rule::Literal(serde_json::Value::String(text.to_string())));
        }

        if let Some(path) = expr.strip_prefix("source.") {
            let parts: Vec<String> = path.split('.').map(str::to_string).collect();
            if parts.is_empty() || parts.len() > 2 || !parts.iter().all(|p| is_identifier(p)) {
                return Err(format!("invalid source reference '{}'", expr));
            }
            return Ok(Rule::Source(parts));
        }

        if is_identifier(expr) {
            return Ok(Rule::Column(expr.to_string()));
        }

        if let Ok(n) = expr.parse::<i64>() {
            return Ok(Rule::Literal(serde_json::json!(n)));
        }
        if let Ok(f) = expr.parse::<f64>() {
            return serde_json::Number::from_f64(f)
                .map(|n| Rule::Literal(serde_json::Value::Number(n)))
                .ok_or_else(|| format!("non-finite number '{}'", expr));
        }

        Err(format!("unrecognised rule '{}'", expr))
    }
}

/// Applies a rule set to records. One instance per write call so every
/// `now` rule in the call sees the same timestamp.
pub struct RuleApplier {
    rules: Vec<(String, Rule)>,
    now: serde_json::Value,
}

impl RuleApplier {
    pub fn new(rules: &RuleSet, now: DateTime<Utc>) -> Result<Self, ConnectorError> {
        let rules = rules
            .iter()
            .map(|(column, expr)| {
                Rule::parse(expr.as_str())
                    .map(|rule| (column.clone(), rule))
                    .map_err(|reason| ConnectorError::RuleEvaluation {
                        column: column.clone(),
                        reason,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            now: serde_json::Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
        })
    }

    /// Produce the row to persist for `record`.
    pub fn apply(&self, record: &WriteRecord) -> Result<Row, ConnectorError> {
        let mut row = record.output.clone();
        for (column, rule) in &self.rules {
            let value = match rule {
                Rule::Now => self.now.clone(),
                Rule::Null => serde_json::Value::Null,
                Rule::StoreDefault => {
                    row.remove(column);
                    continue;
                }
                Rule::Literal(v) => v.clone(),
                Rule::Column(name) => record.output.get(name).cloned().ok_or_else(|| {
                    ConnectorError::RuleEvaluation {
                        column: column.clone(),
                        reason: format!("output column '{}' not present", name),
                    }
                })?,
                Rule::Source(path) => lookup_source(&record.source, path).ok_or_else(|| {
                    ConnectorError::RuleEvaluation {
                        column: column.clone(),
                        reason: format!("source column '{}' not present", path.join(".")),
                    }
                })?,
            };
            row.insert(column.clone(), value);
        }
        Ok(row)
    }

    pub fn apply_all(&self, records: &[WriteRecord]) -> Result<Vec<Row>, ConnectorError> {
        records.iter().map(|r| self.apply(r)).collect()
    }
}

fn lookup_source(source: &Row, path: &[String]) -> Option<serde_json::Value> {
    match path {
        [column] => source.get(column).cloned(),
        [alias, column] => source
            .get(alias)
            .and_then(|v| v.as_object())
            .and_then(|obj| obj.get(column))
            .cloned(),
        _ => None,
    }
}

fn quoted(expr: &str) -> Option<&str> {
    let bytes = expr.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Some(&expr[1..expr.len() - 1]);
        }
    }
    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn rules(pairs: &[(&str, &str)]) -> RuleSet {
        pairs
            .iter()
            .map(|(c, e)| (c.to_string(), RuleExpr::from(*e)))
            .collect()
    }

    #[test]
    fn test_parse_rules() {
        assert_eq!(Rule::parse("now").unwrap(), Rule::Now);
        assert_eq!(Rule::parse("NOW()").unwrap(), Rule::Now);
        assert_eq!(Rule::parse("null").unwrap(), Rule::Null);
        assert_eq!(Rule::parse("default").unwrap(), Rule::StoreDefault);
        assert_eq!(
            Rule::parse("source.modified_ts").unwrap(),
            Rule::Source(vec!["modified_ts".to_string()])
        );
        assert_eq!(
            Rule::parse("source.o.id").unwrap(),
            Rule::Source(vec!["o".to_string(), "id".to_string()])
        );
        assert_eq!(Rule::parse("'web'").unwrap(), Rule::Literal(json!("web")));
        assert_eq!(Rule::parse("42").unwrap(), Rule::Literal(json!(42)));
        assert_eq!(Rule::parse("1.5").unwrap(), Rule::Literal(json!(1.5)));
        assert_eq!(Rule::parse("total").unwrap(), Rule::Column("total".to_string()));
        assert!(Rule::parse("a + b").is_err());
        assert!(Rule::parse("source.").is_err());
        assert!(Rule::parse("").is_err());
    }

    #[test]
    fn test_apply_now_and_source() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let applier = RuleApplier::new(
            &rules(&[("updated_at", "now"), ("changed_at", "source.modified_ts")]),
            now,
        )
        .unwrap();

        let record = WriteRecord::new(
            row(json!({"id": 7})),
            row(json!({"modified_ts": "2024-02-29T10:00:00Z"})),
        );
        let out = applier.apply(&record).unwrap();
        assert_eq!(out["id"], json!(7));
        assert_eq!(out["updated_at"], json!("2024-03-01T12:00:00.000000Z"));
        assert_eq!(out["changed_at"], json!("2024-02-29T10:00:00Z"));
    }

    #[test]
    fn test_apply_default_removes_column() {
        let applier = RuleApplier::new(&rules(&[("created_at", "default")]), Utc::now()).unwrap();
        let record = WriteRecord::new(row(json!({"id": 1, "created_at": "x"})), Row::new());
        let out = applier.apply(&record).unwrap();
        assert!(!out.contains_key("created_at"));
    }

    #[test]
    fn test_apply_missing_source_column_fails() {
        let applier = RuleApplier::new(&rules(&[("a", "source.missing")]), Utc::now()).unwrap();
        let err = applier.apply(&WriteRecord::default()).unwrap_err();
        assert!(matches!(err, ConnectorError::RuleEvaluation { ref column, .. } if column == "a"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_invalid_rule_rejected_up_front() {
        let result = RuleApplier::new(&rules(&[("a", "1 +")]), Utc::now());
        assert!(matches!(result, Err(ConnectorError::RuleEvaluation { .. })));
    }
}
