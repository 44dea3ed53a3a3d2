//! Compound features: interaction terms over already-resolved base
//! features of the same row.

use super::{registry::FeatureRegistry, FeatureValue, NullReason, RowBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum CompoundRule {
    /// Category cross `a_x_b`; a null input reads as `unknown`.
    Cross,
    /// True when every input is a true flag or a positive number.
    AllTrue,
    /// True when the single input is the given category.
    Equals(String),
}

impl CompoundRule {
    fn apply(&self, inputs: &[&FeatureValue]) -> FeatureValue {
        match self {
            Self::Cross => FeatureValue::Category(
                inputs.iter()
                    .map(|v| v.as_category().unwrap_or("unknown"))
                    .collect::<Vec<_>>()
                    .join("_x_"),
            ),
            Self::AllTrue => FeatureValue::Flag(!inputs.is_empty() && inputs.iter().all(|v| truthy(v))),
            Self::Equals(want) => FeatureValue::Flag(
                inputs.first().and_then(|v| v.as_category()) == Some(want.as_str()),
            ),
        }
    }
}

fn truthy(v: &FeatureValue) -> bool {
    match v {
        FeatureValue::Flag(b)    => *b,
        FeatureValue::Numeric(n) => *n > 0.0,
        _                        => false,
    }
}

/// Resolve every compound definition in `registry` against the base
/// values already in `row`. An input missing from the schema makes the
/// compound `Unavailable`.
pub fn compute(registry: &FeatureRegistry, row: &mut RowBuilder) {
    let mut resolved = Vec::new();
    for def in registry.compound_definitions() {
        let inputs: Option<Vec<&FeatureValue>> = def.requires.iter()
            .map(|name| registry.get(name).and_then(|_| row.get(name)))
            .collect();
        let value = match (inputs, &def.rule) {
            (Some(inputs), Some(rule)) => rule.apply(&inputs),
            _ => FeatureValue::Null(NullReason::Unavailable),
        };
        resolved.push((def.name.clone(), value));
    }
    for (name, value) in resolved {
        row.set(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_reads_nulls_as_unknown() {
        let a = FeatureValue::Category("cancellation".into());
        let b = FeatureValue::Null(NullReason::NoContract);
        assert_eq!(CompoundRule::Cross.apply(&[&a, &b]), FeatureValue::Category("cancellation_x_unknown".into()));
    }

    #[test]
    fn all_true_mixes_flags_and_counts() {
        let soon = FeatureValue::Flag(true);
        let two = FeatureValue::Numeric(2.0);
        let zero = FeatureValue::Numeric(0.0);
        assert_eq!(CompoundRule::AllTrue.apply(&[&soon, &two]), FeatureValue::Flag(true));
        assert_eq!(CompoundRule::AllTrue.apply(&[&soon, &zero]), FeatureValue::Flag(false));
    }
}
