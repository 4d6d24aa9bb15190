//! Definition validation.
//!
//! Runs the invariants of each entity kind against the stored definitions
//! and reports every violation found. Nothing is persisted.

use std::collections::HashSet;

use tessera_connectors::ConnectorRegistry;

use crate::error::{AppError, AppResult, DefinitionError, Violation};
use crate::graph::{DependencyGraph, ExecutionPlan};
use crate::logic;
use crate::metadata::{MetadataStore, Snapshot};
use crate::model::{Connection, Entity, Flow, Mapping, Schedule, Step, Table, TableKind, Trigger};
use crate::resolver::{resolve_for, EffectiveRules};

/// Validate `entity` as if it were stored alongside the current definitions.
pub async fn validate_entity(
    store: &dyn MetadataStore,
    connectors: &ConnectorRegistry,
    entity: &Entity,
) -> AppResult<Vec<Violation>> {
    let violations = match entity {
        Entity::Table(table) => validate_table(store, table).await?,
        Entity::Mapping(mapping) => validate_mapping(store, mapping).await?,
        Entity::Step(step) => validate_step(store, step).await?,
        Entity::Flow(flow) => validate_flow(store, flow).await?,
        Entity::Connection(connection) => validate_connection(connectors, connection),
    };

    if !violations.is_empty() {
        tracing::debug!(
            kind = %entity.kind(),
            id = %entity.id(),
            count = violations.len(),
            "Definition has violations"
        );
    }
    Ok(violations)
}

/// Fail with `InvalidDefinition` when `violations` is not empty.
pub fn ensure_valid(violations: Vec<Violation>) -> Result<(), DefinitionError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::InvalidDefinition { violations })
    }
}

async fn validate_table(store: &dyn MetadataStore, table: &Table) -> AppResult<Vec<Violation>> {
    let v = |code: &str, message: String| Violation::new("table", &table.id, code, message);
    let mut violations = Vec::new();

    let mut seen = HashSet::new();
    for column in &table.schema {
        if !seen.insert(column.name.as_str()) {
            violations.push(v(
                "duplicate_column",
                format!("column '{}' is declared twice", column.name),
            ));
        }
    }

    if table.kind == TableKind::Target {
        for column in table.unknown_rule_columns(&table.default_rules) {
            violations.push(v(
                "unknown_rule_column",
                format!("default rule for '{}' names a column not in the schema", column),
            ));
        }
    }

    if store.get_connection(&table.location.connection).await?.is_none() {
        violations.push(v(
            "unknown_reference",
            format!("connection '{}' does not exist", table.location.connection),
        ));
    }

    Ok(violations)
}

async fn validate_mapping(store: &dyn MetadataStore, mapping: &Mapping) -> AppResult<Vec<Violation>> {
    let v = |code: &str, message: String| Violation::new("mapping", &mapping.id, code, message);
    let mut violations = Vec::new();

    if mapping.sources.is_empty() {
        violations.push(v("empty_sources", "a mapping needs at least one source".into()));
    }
    if mapping.source_tables().any(|t| t == mapping.target) {
        violations.push(v(
            "self_reference",
            format!("target '{}' is also a source", mapping.target),
        ));
    }

    for table_id in mapping.source_tables() {
        if store.get_table(table_id).await?.is_none() {
            violations.push(v(
                "unknown_reference",
                format!("source table '{}' does not exist", table_id),
            ));
        }
    }

    match store.get_table(&mapping.target).await? {
        None => violations.push(v(
            "unknown_reference",
            format!("target table '{}' does not exist", mapping.target),
        )),
        Some(target) => {
            if target.kind != TableKind::Target {
                violations.push(v(
                    "target_not_writable",
                    format!("table '{}' is not a target table", target.id),
                ));
            }
            if let Err(e) = resolve_for(mapping, &target) {
                violations.push(v(e.code(), e.to_string()));
            }
        }
    }

    if !mapping.sources.is_empty() {
        for message in logic::check_structure(mapping) {
            violations.push(v("invalid_logic", message));
        }
    }

    Ok(violations)
}

async fn validate_step(store: &dyn MetadataStore, step: &Step) -> AppResult<Vec<Violation>> {
    let v = |code: &str, message: String| Violation::new("step", &step.id, code, message);
    let mut violations = Vec::new();

    if store.get_mapping(&step.mapping).await?.is_none() {
        violations.push(v(
            "unknown_reference",
            format!("mapping '{}' does not exist", step.mapping),
        ));
    }
    if step.depends_on.iter().any(|d| *d == step.id) {
        violations.push(v("self_dependency", "a step cannot depend on itself".into()));
    }

    Ok(violations)
}

async fn validate_flow(store: &dyn MetadataStore, flow: &Flow) -> AppResult<Vec<Violation>> {
    let v = |code: &str, message: String| Violation::new("flow", &flow.id, code, message);
    let mut violations = Vec::new();

    if flow.steps.is_empty() {
        violations.push(v("empty_flow", "a flow needs at least one step".into()));
    }
    let mut seen = HashSet::new();
    for step in &flow.steps {
        if !seen.insert(step.as_str()) {
            violations.push(v("duplicate_step", format!("step '{}' is listed twice", step)));
        }
    }

    if let Trigger::Schedule { expression } = &flow.trigger {
        if let Err(e) = Schedule::parse(expression) {
            violations.push(v("invalid_schedule", e));
        }
    }

    let snapshot = match Snapshot::assemble(store, flow.clone()).await {
        Ok(snapshot) => snapshot,
        Err(AppError::Definition(e)) => {
            violations.push(v(e.code(), e.to_string()));
            return Ok(violations);
        }
        Err(e) => return Err(e),
    };

    let graph = match snapshot.graph() {
        Ok(graph) => graph,
        Err(e) => {
            violations.push(v(e.code(), e.to_string()));
            return Ok(violations);
        }
    };
    if let Err(e) = graph.plan() {
        violations.push(v(e.code(), e.to_string()));
    }

    violations.extend(writer_conflicts(&snapshot, &graph));

    Ok(violations)
}

/// Steps that write one table must agree on every column both set a rule
/// for.
pub fn writer_conflicts(snapshot: &Snapshot, graph: &DependencyGraph) -> Vec<Violation> {
    let flow_id = snapshot.flow.id.as_str();
    let mut violations = Vec::new();

    for (table_id, writers) in graph.shared_targets() {
        let Ok(target) = snapshot.table(table_id) else {
            continue;
        };
        let effective: Vec<(&str, EffectiveRules)> = writers
            .iter()
            .filter_map(|step_id| {
                let step = snapshot.step(step_id).ok()?;
                let mapping = snapshot.mapping(&step.mapping).ok()?;
                resolve_for(mapping, target).ok().map(|rules| (*step_id, rules))
            })
            .collect();

        for (i, (step_a, rules_a)) in effective.iter().enumerate() {
            for (step_b, rules_b) in &effective[i + 1..] {
                let disagreeing: Vec<&str> = rules_a
                    .rules
                    .iter()
                    .filter(|(column, rule)| {
                        rules_b
                            .rules
                            .get(*column)
                            .is_some_and(|other| other.rule != rule.rule)
                    })
                    .map(|(column, _)| column.as_str())
                    .collect();
                if !disagreeing.is_empty() {
                    violations.push(Violation::new(
                        "flow",
                        flow_id,
                        "conflicting_writers",
                        format!(
                            "steps '{}' and '{}' both write '{}' with different rules for {}",
                            step_a,
                            step_b,
                            table_id,
                            disagreeing.join(", ")
                        ),
                    ));
                }
            }
        }
    }

    violations
}

/// Re-check a run snapshot right before it starts: the flow must plan,
/// every step's rules must resolve and shared targets must not conflict.
/// Definitions may have changed since the flow itself was validated.
pub fn check_runnable(snapshot: &Snapshot) -> Result<ExecutionPlan, DefinitionError> {
    let graph = snapshot.graph()?;
    let plan = graph.plan()?;
    for step_id in &plan.order {
        let step = snapshot.step(step_id)?;
        let mapping = snapshot.mapping(&step.mapping)?;
        resolve_for(mapping, snapshot.table(&mapping.target)?)?;
    }
    ensure_valid(writer_conflicts(snapshot, &graph))?;
    Ok(plan)
}

fn validate_connection(connectors: &ConnectorRegistry, connection: &Connection) -> Vec<Violation> {
    if connectors.has(connection.kind) {
        Vec::new()
    } else {
        vec![Violation::new(
            "connection",
            &connection.id,
            "unsupported_kind",
            format!("no connector is registered for kind '{}'", connection.kind),
        )]
    }
}
