//! Projection expressions.

use serde_json::Value;

use super::LogicError;
use crate::model::mapping::split_qualified;
use tessera_connectors::Row;

/// One `select` entry after parameter substitution.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectExpr {
    /// `alias.column`
    Qualified { alias: String, column: String },
    /// Column of the joined row, first source wins.
    Column(String),
    Literal(Value),
}

impl SelectExpr {
    /// Parse a rendered expression. `aliases` are the mapping's source
    /// aliases, used to tell `alias.column` apart from a dotted literal.
    pub fn parse(expr: &str, aliases: &[&str]) -> Result<Self, LogicError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(LogicError::Select("empty expression".to_string()));
        }

        if let Some(inner) = strip_quotes(expr) {
            return Ok(SelectExpr::Literal(Value::String(inner.to_string())));
        }
        match expr {
            "null" => return Ok(SelectExpr::Literal(Value::Null)),
            "true" => return Ok(SelectExpr::Literal(Value::Bool(true))),
            "false" => return Ok(SelectExpr::Literal(Value::Bool(false))),
            _ => {}
        }

        if let Some((alias, column)) = split_qualified(expr) {
            if aliases.contains(&alias) {
                return Ok(SelectExpr::Qualified {
                    alias: alias.to_string(),
                    column: column.to_string(),
                });
            }
        }

        if is_identifier(expr) {
            return Ok(SelectExpr::Column(expr.to_string()));
        }

        if let Ok(i) = expr.parse::<i64>() {
            return Ok(SelectExpr::Literal(Value::from(i)));
        }
        if let Ok(f) = expr.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(SelectExpr::Literal(Value::Number(n)));
            }
        }

        if let Some((alias, _)) = split_qualified(expr) {
            return Err(LogicError::UnknownAlias(alias.to_string()));
        }
        Err(LogicError::Select(format!("unsupported expression '{}'", expr)))
    }

    /// Value for one joined row.
    pub fn evaluate(&self, bindings: &[(&str, Option<&Row>)], flat: &Row) -> Value {
        match self {
            SelectExpr::Qualified { alias, column } => bindings
                .iter()
                .find(|(a, _)| *a == alias.as_str())
                .and_then(|&(_, row)| row)
                .and_then(|r| r.get(column))
                .cloned()
                .unwrap_or(Value::Null),
            SelectExpr::Column(column) => flat.get(column).cloned().unwrap_or(Value::Null),
            SelectExpr::Literal(value) => value.clone(),
        }
    }
}

fn strip_quotes(expr: &str) -> Option<&str> {
    if expr.len() < 2 {
        return None;
    }
    let first = expr.chars().next()?;
    if (first == '\'' || first == '"') && expr.ends_with(first) {
        Some(&expr[1..expr.len() - 1])
    } else {
        None
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
