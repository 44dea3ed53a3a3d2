use churn_core::{
    config::PipelineConfig,
    error::{ChurnError, ChurnResult},
    features::{registry::FeatureRegistry, FeatureRow, FeatureValue},
    scoring::{score_checked, LogisticScorer, ModelArtifact, Score, ScoringFunction},
    types::Date,
};
use std::collections::BTreeMap;

// ── Helpers ──────────────────────────────────────────────────────────────────

fn row(version: &str) -> FeatureRow {
    let mut values = BTreeMap::new();
    values.insert("complaint_count_90d".to_string(), FeatureValue::Numeric(2.0));
    values.insert("is_within_3m_of_renewal".to_string(), FeatureValue::Flag(true));
    values.insert("tenure_days".to_string(), FeatureValue::Numeric(1000.0));
    values.insert("segment".to_string(), FeatureValue::Category("sme".into()));
    FeatureRow::new("E1".into(), Date::from_ymd_opt(2026, 2, 1).unwrap(), version.into(), values)
}

fn artifact() -> ModelArtifact {
    ModelArtifact {
        model_id:       "logit-test".into(),
        schema_version: "fs-test-1".into(),
        intercept:      -1.0,
        coefficients:   BTreeMap::from([
            ("complaint_count_90d".to_string(), 0.5),
            ("is_within_3m_of_renewal".to_string(), 0.8),
            ("tenure_days".to_string(), -0.001),
            ("segment=sme".to_string(), 0.2),
        ]),
    }
}

fn scorer() -> LogisticScorer {
    LogisticScorer::new(artifact(), FeatureRegistry::standard(&PipelineConfig::default_test().features))
}

/// Always returns the same probability, however nonsensical.
struct FixedScorer(f64);

impl ScoringFunction for FixedScorer {
    fn model_id(&self) -> &str { "fixed" }
    fn schema_version(&self) -> &str { "fs-test-1" }
    fn score(&self, _row: &FeatureRow, _top: usize) -> ChurnResult<Score> {
        Ok(Score { probability: self.0, drivers: Vec::new() })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn rows_from_another_schema_are_refused() {
    let err = score_checked(&scorer(), &row("fs-test-2"), 3).unwrap_err();
    match err {
        ChurnError::SchemaMismatch { row_version, model_version, model_id } => {
            assert_eq!(row_version, "fs-test-2");
            assert_eq!(model_version, "fs-test-1");
            assert_eq!(model_id, "logit-test");
        }
        other => panic!("expected SchemaMismatch, got {other}"),
    }
}

/// z = -1 + 1.0 + 0.8 - 1.0 + 0.2 = 0.0, so p = 0.5 exactly.
#[test]
fn logistic_scorer_ranks_positive_drivers() {
    let score = score_checked(&scorer(), &row("fs-test-1"), 2).unwrap();
    assert!((score.probability - 0.5).abs() < 1e-12, "got {}", score.probability);
    assert_eq!(score.drivers, vec!["complaint_count_90d", "is_within_3m_of_renewal"]);
}

#[test]
fn probabilities_outside_unit_interval_are_rejected() {
    for p in [1.2, -0.1, f64::NAN] {
        assert!(
            matches!(score_checked(&FixedScorer(p), &row("fs-test-1"), 3), Err(ChurnError::InvalidProbability { .. })),
            "probability {p} must be rejected"
        );
    }
    assert!(score_checked(&FixedScorer(1.0), &row("fs-test-1"), 3).is_ok());
}

#[test]
fn artifact_loads_from_json() {
    let dir = std::env::temp_dir().join(format!("churn-model-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("model.json");
    std::fs::write(&path, serde_json::to_string(&artifact()).unwrap()).unwrap();

    let loaded = ModelArtifact::load(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded, artifact());
    std::fs::remove_dir_all(&dir).ok();
}
