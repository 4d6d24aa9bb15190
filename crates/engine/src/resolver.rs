//! Override resolution.
//!
//! Merges a target table's default rules with a mapping's overrides into the
//! effective rule set used for one write. Rule expressions are opaque here:
//! the merge is purely by column name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_connectors::{RuleExpr, RuleSet};

use crate::error::DefinitionError;
use crate::model::{Mapping, Table};

/// Which layer supplied a column's rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    Default,
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRule {
    pub rule: RuleExpr,
    pub origin: RuleOrigin,
}

/// Column → rule with provenance. Columns with no rule are absent.
pub type ResolvedRules = BTreeMap<String, ResolvedRule>;

/// Effective rules of one mapping against its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveRules {
    pub mapping_id: String,
    pub target_id: String,
    pub rules: ResolvedRules,
}

impl EffectiveRules {
    /// Plain rule set handed to connectors.
    pub fn rule_set(&self) -> RuleSet {
        self.rules
            .iter()
            .map(|(column, resolved)| (column.clone(), resolved.rule.clone()))
            .collect()
    }
}

/// Override wins, otherwise default, otherwise absent.
pub fn resolve(defaults: &RuleSet, overrides: &RuleSet) -> ResolvedRules {
    let mut rules: ResolvedRules = defaults
        .iter()
        .map(|(column, rule)| {
            (
                column.clone(),
                ResolvedRule {
                    rule: rule.clone(),
                    origin: RuleOrigin::Default,
                },
            )
        })
        .collect();

    for (column, rule) in overrides {
        rules.insert(
            column.clone(),
            ResolvedRule {
                rule: rule.clone(),
                origin: RuleOrigin::Override,
            },
        );
    }

    rules
}

/// Resolve `mapping` against `target`, checking that every override names a
/// target column.
pub fn resolve_for(mapping: &Mapping, target: &Table) -> Result<EffectiveRules, DefinitionError> {
    let unknown = target.unknown_rule_columns(&mapping.overrides);
    if !unknown.is_empty() {
        return Err(DefinitionError::ConflictingRule {
            mapping: mapping.id.clone(),
            target: target.id.clone(),
            columns: unknown.into_iter().map(str::to_string).collect(),
        });
    }

    Ok(EffectiveRules {
        mapping_id: mapping.id.clone(),
        target_id: target.id.clone(),
        rules: resolve(&target.default_rules, &mapping.overrides),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, MappingLogic, SourceRef, TableKind};
    use proptest::prelude::*;
    use tessera_connectors::Location;

    fn rules(pairs: &[(&str, &str)]) -> RuleSet {
        pairs
            .iter()
            .map(|(c, r)| (c.to_string(), RuleExpr::from(*r)))
            .collect()
    }

    fn orders() -> Table {
        Table {
            id: "orders".into(),
            kind: TableKind::Target,
            schema: vec![Column::new("id"), Column::new("updated_at")],
            default_rules: rules(&[("updated_at", "now")]),
            location: Location::new("warehouse", "orders"),
        }
    }

    fn mapping(id: &str, overrides: RuleSet) -> Mapping {
        Mapping {
            id: id.into(),
            sources: vec![SourceRef::new("raw_orders")],
            target: "orders".into(),
            logic: MappingLogic::default(),
            overrides,
        }
    }

    #[test]
    fn test_default_applies_without_override() {
        let effective = resolve_for(&mapping("m1", RuleSet::new()), &orders()).unwrap();
        let rule = &effective.rules["updated_at"];
        assert_eq!(rule.rule.as_str(), "now");
        assert_eq!(rule.origin, RuleOrigin::Default);
    }

    #[test]
    fn test_override_wins() {
        let m2 = mapping("m2", rules(&[("updated_at", "source.modified_ts")]));
        let effective = resolve_for(&m2, &orders()).unwrap();
        let rule = &effective.rules["updated_at"];
        assert_eq!(rule.rule.as_str(), "source.modified_ts");
        assert_eq!(rule.origin, RuleOrigin::Override);
        assert_eq!(effective.rule_set().len(), 1);
    }

    #[test]
    fn test_override_on_unknown_column() {
        let m3 = mapping("m3", rules(&[("loaded_by", "'etl'")]));
        let err = resolve_for(&m3, &orders()).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::ConflictingRule {
                mapping: "m3".into(),
                target: "orders".into(),
                columns: vec!["loaded_by".into()],
            }
        );
    }

    fn rule_set_strategy() -> impl Strategy<Value = RuleSet> {
        prop::collection::btree_map("[a-e]", "[a-z]{1,6}", 0..5)
            .prop_map(|m| m.into_iter().map(|(k, v)| (k, RuleExpr::new(v))).collect())
    }

    proptest! {
        #[test]
        fn resolve_picks_override_then_default(
            defaults in rule_set_strategy(),
            overrides in rule_set_strategy(),
        ) {
            let resolved = resolve(&defaults, &overrides);
            for column in ["a", "b", "c", "d", "e"] {
                let expected = overrides.get(column).or_else(|| defaults.get(column));
                prop_assert_eq!(resolved.get(column).map(|r| &r.rule), expected);
            }
            prop_assert!(resolved
                .keys()
                .all(|c| defaults.contains_key(c) || overrides.contains_key(c)));
        }
    }
}
