//! Row filter predicates evaluated with Rhai.
//!
//! Each source alias is bound as an object map (`o.amount > 100`). Columns
//! of the joined row are also bound by bare name when they do not clash
//! with an alias.

use rhai::{Dynamic, Engine, Scope, AST};

use super::LogicError;
use tessera_connectors::Row;

/// Upper bound on Rhai operations per row.
const MAX_OPERATIONS: u64 = 100_000;

pub struct FilterPredicate {
    source: String,
    engine: Engine,
    ast: AST,
}

impl std::fmt::Debug for FilterPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPredicate")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl FilterPredicate {
    pub fn compile(expression: &str) -> Result<Self, LogicError> {
        let engine = create_engine();
        let ast = engine
            .compile_expression(expression)
            .map_err(|e| LogicError::Filter(format!("cannot parse '{}': {}", expression, e)))?;
        Ok(Self {
            source: expression.to_string(),
            engine,
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one joined row. `bindings` pairs each alias with its
    /// row (`None` for an unmatched left join).
    pub fn matches(&self, bindings: &[(&str, Option<&Row>)], flat: &Row) -> Result<bool, LogicError> {
        let mut scope = Scope::new();
        for (column, value) in flat {
            if !bindings.iter().any(|(alias, _)| *alias == column.as_str()) {
                scope.push_dynamic(column.clone(), json_to_dynamic(value));
            }
        }
        for (alias, row) in bindings {
            let value = match row {
                Some(row) => row_to_map(row),
                None => rhai::Map::new(),
            };
            scope.push(alias.to_string(), value);
        }

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| LogicError::Filter(format!("'{}' failed: {}", self.source, e)))?;

        result.as_bool().map_err(|type_name| {
            LogicError::Filter(format!(
                "'{}' must evaluate to a boolean, got {}",
                self.source, type_name
            ))
        })
    }
}

fn create_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);

    engine.register_fn("is_null", |value: Dynamic| value.is_unit());
    engine.register_fn("lower", |s: &str| s.to_lowercase());
    engine.register_fn("upper", |s: &str| s.to_uppercase());
    engine.register_fn("log", |msg: &str| {
        tracing::debug!(target: "rhai", "{}", msg);
    });

    engine
}

fn row_to_map(row: &Row) -> rhai::Map {
    row.iter()
        .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
        .collect()
}

pub(crate) fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(arr) => {
            let rhai_arr: rhai::Array = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(rhai_arr)
        }
        serde_json::Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_alias_property_access() {
        let predicate = FilterPredicate::compile("o.amount > 100 && c.tier == \"gold\"").unwrap();
        let o = row(json!({ "amount": 150 }));
        let c = row(json!({ "tier": "gold" }));
        let flat = Row::new();
        assert!(predicate
            .matches(&[("o", Some(&o)), ("c", Some(&c))], &flat)
            .unwrap());

        let small = row(json!({ "amount": 50 }));
        assert!(!predicate
            .matches(&[("o", Some(&small)), ("c", Some(&c))], &flat)
            .unwrap());
    }

    #[test]
    fn test_bare_column_binding() {
        let predicate = FilterPredicate::compile("status == \"open\"").unwrap();
        let flat = row(json!({ "status": "open" }));
        assert!(predicate.matches(&[], &flat).unwrap());
    }

    #[test]
    fn test_unmatched_left_join_is_empty_map() {
        let predicate = FilterPredicate::compile("is_null(c.tier)").unwrap();
        let o = row(json!({ "amount": 1 }));
        assert!(predicate
            .matches(&[("o", Some(&o)), ("c", None)], &Row::new())
            .unwrap());
    }

    #[test]
    fn test_non_boolean_result() {
        let predicate = FilterPredicate::compile("1 + 1").unwrap();
        let err = predicate.matches(&[], &Row::new()).unwrap_err();
        assert!(matches!(err, LogicError::Filter(_)));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            FilterPredicate::compile("o.amount >"),
            Err(LogicError::Filter(_))
        ));
    }
}
