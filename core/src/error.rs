use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChurnError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Leakage violation: feature '{feature}' for {entity_id} used data at {observed} after asof {asof}")]
    LeakageViolation {
        entity_id: String,
        feature:   String,
        asof:      NaiveDate,
        observed:  String,
    },

    #[error("Schema mismatch: feature row is '{row_version}', model '{model_id}' was trained on '{model_version}'")]
    SchemaMismatch {
        row_version:   String,
        model_version: String,
        model_id:      String,
    },

    #[error("Schema version '{version}' is already registered with different feature definitions")]
    SchemaDefinitionConflict { version: String },

    #[error("Horizon ambiguity: label rows carry horizons {horizons:?} and no horizon is selected")]
    HorizonAmbiguity { horizons: Vec<u32> },

    #[error("Duplicate label row for ({entity_id}, {asof}, {horizon_days}d)")]
    DuplicateLabel {
        entity_id:    String,
        asof:         NaiveDate,
        horizon_days: u32,
    },

    #[error("Mixed feature schema versions in one build: {versions:?}")]
    MixedSchemaVersions { versions: Vec<String> },

    #[error("risk_score {score} for {entity_id} is outside [0, 1]")]
    InvalidRiskScore { entity_id: String, score: f64 },

    #[error("expected_margin_impact {value} for {entity_id} is not a finite number")]
    InvalidMarginImpact { entity_id: String, value: f64 },

    #[error("Scoring function returned probability {value} for {entity_id}")]
    InvalidProbability { entity_id: String, value: f64 },

    #[error("Recommendation for {entity_id} violates its contract: {reason}")]
    InvalidRecommendation { entity_id: String, reason: String },

    #[error("Grain mismatch on series '{series}': cannot aggregate {from} into {to}")]
    GrainMismatch {
        series: String,
        from:   String,
        to:     String,
    },

    #[error("No eligible entities for {stage}: {context}")]
    NoEligibleEntities { stage: String, context: String },

    #[error("Duplicate feature row for ({entity_id}, {asof})")]
    DuplicateFeatureRow { entity_id: String, asof: NaiveDate },

    #[error("Duplicate scoring input for ({entity_id}, {run_date}): one feature row per entity per run")]
    DuplicateScoringEntity { entity_id: String, run_date: NaiveDate },

    #[error("Run {run_id} aborted after {batches_done} batch(es)")]
    RunAborted { run_id: String, batches_done: usize },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ChurnResult<T> = Result<T, ChurnError>;
