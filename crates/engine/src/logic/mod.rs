//! Mapping logic: equi-joins, filter and projection over source rows.
//!
//! Logic is compiled once per step run, after step and run parameters have
//! been substituted, then applied to the fully read sources.

pub mod filter;
pub mod select;
pub mod template;

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::mapping::split_qualified;
use crate::model::{JoinKind, Mapping};
use filter::FilterPredicate;
use select::SelectExpr;
use template::{is_whole_expression, TemplateEngine};
use tessera_connectors::{Row, WriteRecord};

/// Errors in mapping logic. Always terminal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogicError {
    #[error("template error: {0}")]
    Template(String),

    #[error("filter error: {0}")]
    Filter(String),

    #[error("select error: {0}")]
    Select(String),

    #[error("join error: {0}")]
    Join(String),

    #[error("unknown source alias '{0}'")]
    UnknownAlias(String),
}

impl LogicError {
    pub fn kind(&self) -> &'static str {
        "logic"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JoinPlan {
    /// Position of the source being attached.
    source: usize,
    kind: JoinKind,
    /// Position and column of the already joined side.
    left: (usize, String),
    right_column: String,
}

/// Executable form of a mapping's logic.
#[derive(Debug)]
pub struct CompiledLogic {
    aliases: Vec<String>,
    joins: Vec<JoinPlan>,
    filter: Option<FilterPredicate>,
    select: Vec<(String, SelectExpr)>,
}

/// Check aliases and joins of a mapping without rendering templates.
/// Returns one message per problem.
pub fn check_structure(mapping: &Mapping) -> Vec<String> {
    match plan_joins(mapping) {
        Ok(_) => Vec::new(),
        Err(errors) => errors,
    }
}

fn plan_joins(mapping: &Mapping) -> Result<(Vec<String>, Vec<JoinPlan>), Vec<String>> {
    let aliases: Vec<String> = mapping.sources.iter().map(|s| s.alias().to_string()).collect();
    let mut errors = Vec::new();
    if aliases.is_empty() {
        return Err(vec!["mapping has no sources".to_string()]);
    }

    let mut seen = std::collections::HashSet::new();
    for alias in &aliases {
        if !seen.insert(alias.as_str()) {
            errors.push(format!("duplicate source alias '{}'", alias));
        }
    }

    let position = |alias: &str| aliases.iter().position(|a| a == alias);
    let mut joined = vec![false; aliases.len()];
    let mut attempted = vec![false; aliases.len()];
    if !joined.is_empty() {
        joined[0] = true;
    }

    let mut plans = Vec::new();
    for join in &mapping.logic.joins {
        let Some(source) = position(&join.source) else {
            errors.push(format!("join attaches unknown alias '{}'", join.source));
            continue;
        };
        if joined[source] {
            errors.push(format!("alias '{}' is joined more than once", join.source));
            continue;
        }
        attempted[source] = true;

        let left = match split_qualified(&join.left) {
            Some((alias, column)) => match position(alias) {
                Some(p) if joined[p] => Some((p, column.to_string())),
                Some(_) => {
                    errors.push(format!(
                        "join on '{}' refers to '{}' before it is joined",
                        join.source, alias
                    ));
                    None
                }
                None => {
                    errors.push(format!("join left side uses unknown alias '{}'", alias));
                    None
                }
            },
            None => {
                errors.push(format!("join left side '{}' is not alias.column", join.left));
                None
            }
        };

        let right_column = match split_qualified(&join.right) {
            Some((alias, column)) if alias == join.source => Some(column.to_string()),
            _ => {
                errors.push(format!(
                    "join right side '{}' must be {}.<column>",
                    join.right, join.source
                ));
                None
            }
        };

        if let (Some(left), Some(right_column)) = (left, right_column) {
            joined[source] = true;
            plans.push(JoinPlan {
                source,
                kind: join.kind,
                left,
                right_column,
            });
        }
    }

    for (i, alias) in aliases.iter().enumerate() {
        if !joined[i] && !attempted[i] {
            errors.push(format!("source '{}' is never joined", alias));
        }
    }

    if errors.is_empty() {
        Ok((aliases, plans))
    } else {
        Err(errors)
    }
}

impl CompiledLogic {
    /// Render templates in `filter` and `select` against `context`, then
    /// parse them.
    pub fn compile(
        mapping: &Mapping,
        templates: &TemplateEngine,
        context: &Value,
    ) -> Result<Self, LogicError> {
        let (aliases, joins) = plan_joins(mapping).map_err(|errors| LogicError::Join(errors.join("; ")))?;
        let alias_refs: Vec<&str> = aliases.iter().map(String::as_str).collect();

        let filter = match &mapping.logic.filter {
            Some(expression) => {
                let rendered = templates.render(expression, context)?;
                Some(FilterPredicate::compile(&rendered)?)
            }
            None => None,
        };

        let mut select = Vec::with_capacity(mapping.logic.select.len());
        for (column, expression) in &mapping.logic.select {
            let expr = if is_whole_expression(expression) {
                SelectExpr::Literal(templates.render_to_value(expression, context)?)
            } else {
                let rendered = templates.render(expression, context)?;
                SelectExpr::parse(&rendered, &alias_refs)?
            };
            select.push((column.clone(), expr));
        }

        Ok(Self {
            aliases,
            joins,
            filter,
            select,
        })
    }

    /// Join, filter and project. `sources` holds the rows of each source in
    /// mapping order.
    pub fn apply(&self, sources: Vec<Vec<Row>>) -> Result<Vec<WriteRecord>, LogicError> {
        if sources.len() != self.aliases.len() {
            return Err(LogicError::Join(format!(
                "expected {} sources, got {}",
                self.aliases.len(),
                sources.len()
            )));
        }

        let mut sources: Vec<Option<Vec<Row>>> = sources.into_iter().map(Some).collect();
        let first = sources[0].take().unwrap_or_default();
        let width = self.aliases.len();
        let mut tuples: Vec<Vec<Option<Row>>> = first
            .into_iter()
            .map(|row| {
                let mut tuple = vec![None; width];
                tuple[0] = Some(row);
                tuple
            })
            .collect();

        for join in &self.joins {
            let right_rows = sources[join.source].take().unwrap_or_default();
            tuples = hash_join(tuples, right_rows, join);
        }

        let mut records = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let bindings: Vec<(&str, Option<&Row>)> = self
                .aliases
                .iter()
                .map(String::as_str)
                .zip(tuple.iter().map(Option::as_ref))
                .collect();
            let flat = flatten(&bindings);

            if let Some(filter) = &self.filter {
                if !filter.matches(&bindings, &flat)? {
                    continue;
                }
            }

            let output = if self.select.is_empty() {
                tuple[0].clone().unwrap_or_default()
            } else {
                self.select
                    .iter()
                    .map(|(column, expr)| (column.clone(), expr.evaluate(&bindings, &flat)))
                    .collect()
            };

            records.push(WriteRecord::new(output, source_record(&bindings, flat)));
        }

        Ok(records)
    }
}

/// Join key; null and missing values never match. Integral numbers key
/// the same whether stored as integers or floats (`10` and `10.0`).
fn join_key(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(format!("s:{}", s)),
        Some(Value::Number(n)) => Some(format!("n:{}", number_key(n))),
        Some(other) => Some(format!("v:{}", other)),
    }
}

fn number_key(n: &serde_json::Number) -> String {
    // Largest float range where every integer is exact.
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() <= EXACT => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

fn hash_join(
    tuples: Vec<Vec<Option<Row>>>,
    right_rows: Vec<Row>,
    join: &JoinPlan,
) -> Vec<Vec<Option<Row>>> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, row) in right_rows.iter().enumerate() {
        if let Some(key) = join_key(row.get(&join.right_column)) {
            index.entry(key).or_default().push(i);
        }
    }

    let (left_pos, left_column) = &join.left;
    let mut joined = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        let key = join_key(
            tuple[*left_pos]
                .as_ref()
                .and_then(|row| row.get(left_column)),
        );
        let matches = key.and_then(|k| index.get(&k));
        match matches {
            Some(matches) => {
                for &m in matches {
                    let mut next = tuple.clone();
                    next[join.source] = Some(right_rows[m].clone());
                    joined.push(next);
                }
            }
            None if join.kind == JoinKind::Left => joined.push(tuple),
            None => {}
        }
    }
    joined
}

/// Columns of every bound source; the first source defining a column wins.
fn flatten(bindings: &[(&str, Option<&Row>)]) -> Row {
    let mut flat = Row::new();
    for (_, row) in bindings {
        if let Some(row) = row {
            for (column, value) in row.iter() {
                if !flat.contains_key(column) {
                    flat.insert(column.clone(), value.clone());
                }
            }
        }
    }
    flat
}

/// Source record handed to rules: one object per alias plus the flattened
/// columns.
fn source_record(bindings: &[(&str, Option<&Row>)], flat: Row) -> Row {
    let mut record = Row::new();
    for (alias, row) in bindings {
        let value = match row {
            Some(row) => Value::Object((*row).clone()),
            None => Value::Null,
        };
        record.insert(alias.to_string(), value);
    }
    for (column, value) in flat {
        record.entry(column).or_insert(value);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Join, MappingLogic, SourceRef};
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn orders_mapping(kind: JoinKind) -> Mapping {
        Mapping {
            id: "enrich".into(),
            sources: vec![
                SourceRef::aliased("raw_orders", "o"),
                SourceRef::aliased("customers", "c"),
            ],
            target: "orders".into(),
            logic: MappingLogic {
                joins: vec![Join {
                    source: "c".into(),
                    kind,
                    left: "o.customer_id".into(),
                    right: "c.id".into(),
                }],
                filter: Some("o.amount >= {{ min_amount }}".into()),
                select: [
                    ("id".to_string(), "o.id".to_string()),
                    ("customer".to_string(), "c.name".to_string()),
                    ("batch".to_string(), "{{ batch }}".to_string()),
                ]
                .into_iter()
                .collect(),
            },
            overrides: Default::default(),
        }
    }

    fn sources() -> Vec<Vec<Row>> {
        vec![
            rows(json!([
                { "id": 1, "customer_id": 10, "amount": 50 },
                { "id": 2, "customer_id": 11, "amount": 500 },
                { "id": 3, "customer_id": 99, "amount": 700 },
            ])),
            rows(json!([
                { "id": 10, "name": "Ada" },
                { "id": 11, "name": "Grace" },
            ])),
        ]
    }

    #[test]
    fn test_inner_join_filter_select() {
        let templates = TemplateEngine::new();
        let ctx = json!({ "min_amount": 100, "batch": "b-7" });
        let logic = CompiledLogic::compile(&orders_mapping(JoinKind::Inner), &templates, &ctx).unwrap();
        let records = logic.apply(sources()).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output["id"], json!(2));
        assert_eq!(records[0].output["customer"], json!("Grace"));
        assert_eq!(records[0].output["batch"], json!("b-7"));
        assert_eq!(records[0].source["o"]["amount"], json!(500));
        assert_eq!(records[0].source["amount"], json!(500));
    }

    #[test]
    fn test_left_join_keeps_unmatched() {
        let templates = TemplateEngine::new();
        let ctx = json!({ "min_amount": 100, "batch": 1 });
        let logic = CompiledLogic::compile(&orders_mapping(JoinKind::Left), &templates, &ctx).unwrap();
        let records = logic.apply(sources()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].output["id"], json!(3));
        assert_eq!(records[1].output["customer"], Value::Null);
        assert_eq!(records[1].source["c"], Value::Null);
    }

    #[test]
    fn test_passthrough_without_select() {
        let mapping = Mapping {
            id: "copy".into(),
            sources: vec![SourceRef::new("raw")],
            target: "stage".into(),
            logic: MappingLogic::default(),
            overrides: Default::default(),
        };
        let logic = CompiledLogic::compile(&mapping, &TemplateEngine::new(), &json!({})).unwrap();
        let records = logic.apply(vec![rows(json!([{ "a": 1 }, { "a": 2 }]))]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].output["a"], json!(2));
    }

    #[test]
    fn test_missing_param_fails_compile() {
        let err = CompiledLogic::compile(&orders_mapping(JoinKind::Inner), &TemplateEngine::new(), &json!({}))
            .unwrap_err();
        assert!(matches!(err, LogicError::Template(_)));
        assert_eq!(err.kind(), "logic");
    }

    #[test]
    fn test_structure_errors() {
        let mut mapping = orders_mapping(JoinKind::Inner);
        mapping.logic.joins.clear();
        assert_eq!(check_structure(&mapping), vec!["source 'c' is never joined"]);

        mapping.logic.joins.push(Join {
            source: "c".into(),
            kind: JoinKind::Inner,
            left: "x.id".into(),
            right: "c.id".into(),
        });
        assert_eq!(
            check_structure(&mapping),
            vec!["join left side uses unknown alias 'x'"]
        );
    }

    #[test]
    fn test_integral_float_keys_match_integers() {
        let templates = TemplateEngine::new();
        let mut mapping = orders_mapping(JoinKind::Inner);
        mapping.logic.filter = None;
        mapping.logic.select.remove("batch");
        let logic = CompiledLogic::compile(&mapping, &templates, &json!({})).unwrap();
        let records = logic
            .apply(vec![
                rows(json!([
                    { "id": 1, "customer_id": 10 },
                    { "id": 2, "customer_id": 11.5 },
                ])),
                rows(json!([
                    { "id": 10.0, "name": "Ada" },
                    { "id": 11, "name": "Grace" },
                ])),
            ])
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output["customer"], json!("Ada"));
    }

    #[test]
    fn test_null_keys_do_not_match() {
        let templates = TemplateEngine::new();
        let mut mapping = orders_mapping(JoinKind::Inner);
        mapping.logic.filter = None;
        mapping.logic.select.remove("batch");
        let logic = CompiledLogic::compile(&mapping, &templates, &json!({})).unwrap();
        let records = logic
            .apply(vec![
                rows(json!([{ "id": 1, "customer_id": null }])),
                rows(json!([{ "id": null, "name": "ghost" }])),
            ])
            .unwrap();
        assert!(records.is_empty());
    }
}
