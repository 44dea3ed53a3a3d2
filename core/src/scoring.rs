//! Scoring function boundary.
//!
//! The classifier is a replaceable collaborator behind `ScoringFunction`.
//! Callers go through `score_checked`, which pins the schema version and
//! rejects anything that is not a probability.

use crate::{
    error::{ChurnError, ChurnResult},
    features::{registry::FeatureRegistry, FeatureRow},
    types::SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub probability: f64,
    /// Contributing feature names, strongest first.
    pub drivers:     Vec<String>,
}

pub trait ScoringFunction: Send + Sync {
    fn model_id(&self) -> &str;

    /// Feature schema version the model was trained on.
    fn schema_version(&self) -> &str;

    fn score(&self, row: &FeatureRow, top_drivers: usize) -> ChurnResult<Score>;
}

/// Fails with `SchemaMismatch` unless the row was built under the model's
/// schema version.
pub fn check_schema(scorer: &dyn ScoringFunction, row: &FeatureRow) -> ChurnResult<()> {
    if row.schema_version() != scorer.schema_version() {
        return Err(ChurnError::SchemaMismatch {
            row_version:   row.schema_version().to_string(),
            model_version: scorer.schema_version().to_string(),
            model_id:      scorer.model_id().to_string(),
        });
    }
    Ok(())
}

pub fn score_checked(scorer: &dyn ScoringFunction, row: &FeatureRow, top_drivers: usize) -> ChurnResult<Score> {
    check_schema(scorer, row)?;
    let score = scorer.score(row, top_drivers)?;
    if !score.probability.is_finite() || !(0.0..=1.0).contains(&score.probability) {
        return Err(ChurnError::InvalidProbability {
            entity_id: row.entity_id().to_string(),
            value:     score.probability,
        });
    }
    Ok(score)
}

/// JSON model artifact for `LogisticScorer`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArtifact {
    pub model_id:       String,
    pub schema_version: SchemaVersion,
    pub intercept:      f64,
    /// Keyed by encoded column name (see `FeatureRegistry::encode`).
    pub coefficients:   BTreeMap<String, f64>,
}

impl ModelArtifact {
    pub fn load(path: &str) -> ChurnResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let artifact: Self = serde_json::from_str(&content)?;
        if !artifact.intercept.is_finite() || artifact.coefficients.values().any(|c| !c.is_finite()) {
            return Err(ChurnError::Config(format!("model {}: non-finite weight", artifact.model_id)));
        }
        Ok(artifact)
    }
}

/// Reference adapter: a logistic model over the registry encoding.
pub struct LogisticScorer {
    artifact: ModelArtifact,
    registry: FeatureRegistry,
}

impl LogisticScorer {
    pub fn new(artifact: ModelArtifact, registry: FeatureRegistry) -> Self {
        Self { artifact, registry }
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl ScoringFunction for LogisticScorer {
    fn model_id(&self) -> &str {
        &self.artifact.model_id
    }

    fn schema_version(&self) -> &str {
        &self.artifact.schema_version
    }

    fn score(&self, row: &FeatureRow, top_drivers: usize) -> ChurnResult<Score> {
        let encoded = self.registry.encode(row);
        let mut contributions: Vec<(&str, f64)> = self.artifact.coefficients.iter()
            .filter_map(|(name, w)| encoded.get(name).map(|x| (name.as_str(), w * x)))
            .collect();
        let z = self.artifact.intercept + contributions.iter().map(|(_, c)| c).sum::<f64>();

        contributions.retain(|(_, c)| *c > 0.0);
        contributions.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let drivers = contributions.into_iter()
            .take(top_drivers)
            .map(|(name, _)| name.to_string())
            .collect();

        Ok(Score { probability: sigmoid(z), drivers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_is_bounded() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(800.0) <= 1.0);
        assert!(sigmoid(-800.0) >= 0.0);
    }
}
