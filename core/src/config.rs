use crate::{
    error::{ChurnError, ChurnResult},
    policy::PolicyTables,
    tiering::TierBoundaries,
    types::{Date, SchemaVersion},
};
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Longest trailing window or label horizon a config may declare (ten years).
pub const MAX_WINDOW_DAYS: u32 = 3660;

/// Trailing window lengths, in days, shared by every windowed feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureWindows {
    pub short_days:  u32,
    pub medium_days: u32,
    pub long_days:   u32,
    pub year_days:   u32,
}

impl Default for FeatureWindows {
    fn default() -> Self {
        Self { short_days: 30, medium_days: 90, long_days: 180, year_days: 365 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureConfig {
    pub schema_version:       SchemaVersion,
    pub windows:              FeatureWindows,
    /// Days to renewal at or under which a contract counts as "renewing soon".
    pub renewal_soon_days:    i64,
    /// Absolute tariff move that counts as a price change.
    pub price_change_epsilon: f64,
    /// Feature names left out of this schema version.
    #[serde(default)]
    pub disabled:             Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelConfig {
    /// The one horizon a training set is built for. Required whenever the
    /// label file carries more than one horizon.
    #[serde(default)]
    pub horizon_days:        Option<u32>,
    /// Last as-of date assigned to the training split (inclusive).
    pub train_end:           Date,
    /// Last as-of date assigned to the validation split (inclusive).
    pub validation_end:      Date,
    /// Drop examples whose label window runs past their split cutoff.
    #[serde(default)]
    pub purge_label_overlap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub batch_size:  usize,
    pub workers:     usize,
    /// Driver features requested from the scoring function per record.
    pub top_drivers: usize,
}

/// Everything a run reads, constructed once and passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub features: FeatureConfig,
    pub tiers:    TierBoundaries,
    pub policy:   PolicyTables,
    pub labels:   LabelConfig,
    pub run:      RunConfig,
}

fn read_json<T: DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))
}

impl PipelineConfig {
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let features: FeatureConfig = read_json(&format!("{data_dir}/features/feature_config.json"))?;
        let tiers: TierBoundaries = read_json(&format!("{data_dir}/policy/risk_tiers.json"))?;
        let policy: PolicyTables = read_json(&format!("{data_dir}/policy/retention_policy.json"))?;
        let labels: LabelConfig = read_json(&format!("{data_dir}/labels/label_config.json"))?;
        let run: RunConfig = read_json(&format!("{data_dir}/run/run_config.json"))?;

        let config = Self { features, tiers, policy, labels, run };
        config.validate()?;
        log::info!(
            "config: loaded from {data_dir} (schema={}, batch_size={}, workers={})",
            config.features.schema_version, config.run.batch_size, config.run.workers
        );
        Ok(config)
    }

    /// Fails fast on anything a run could not honour. Tier bands are
    /// already validated when deserialized.
    pub fn validate(&self) -> ChurnResult<()> {
        let err = |msg: String| Err(ChurnError::Config(msg));

        let f = &self.features;
        if f.schema_version.trim().is_empty() {
            return err("features: schema_version is empty".into());
        }
        let w = &f.windows;
        if w.short_days == 0 {
            return err("features: windows must be at least one day".into());
        }
        if !(w.short_days < w.medium_days && w.medium_days < w.long_days && w.long_days < w.year_days) {
            return err(format!(
                "features: windows must strictly increase, got {}/{}/{}/{}",
                w.short_days, w.medium_days, w.long_days, w.year_days
            ));
        }
        if w.year_days > MAX_WINDOW_DAYS {
            return err(format!(
                "features: year window of {} days exceeds the {MAX_WINDOW_DAYS}-day maximum",
                w.year_days
            ));
        }
        if f.renewal_soon_days <= 0 {
            return err(format!("features: renewal_soon_days must be positive, got {}", f.renewal_soon_days));
        }
        if !f.price_change_epsilon.is_finite() || f.price_change_epsilon < 0.0 {
            return err(format!("features: price_change_epsilon must be >= 0, got {}", f.price_change_epsilon));
        }

        self.policy.validate()?;

        let l = &self.labels;
        if l.train_end >= l.validation_end {
            return err(format!(
                "labels: train_end {} must be before validation_end {}",
                l.train_end, l.validation_end
            ));
        }
        match l.horizon_days {
            Some(0) => return err("labels: horizon_days must be positive".into()),
            Some(h) if h > MAX_WINDOW_DAYS => {
                return err(format!("labels: horizon_days {h} exceeds the {MAX_WINDOW_DAYS}-day maximum"));
            }
            _ => {}
        }

        let r = &self.run;
        if r.batch_size == 0 {
            return err("run: batch_size must be positive".into());
        }
        if r.workers == 0 {
            return err("run: workers must be positive".into());
        }
        Ok(())
    }

    /// Hardcoded config for tests. Matches `data/`.
    pub fn default_test() -> Self {
        Self {
            features: FeatureConfig {
                schema_version:       "fs-test-1".into(),
                windows:              FeatureWindows::default(),
                renewal_soon_days:    90,
                price_change_epsilon: 0.001,
                disabled:             Vec::new(),
            },
            tiers:  TierBoundaries::default(),
            policy: PolicyTables::default(),
            labels: LabelConfig {
                horizon_days:        None,
                train_end:           NaiveDate::from_ymd_opt(2025, 12, 31).unwrap_or_default(),
                validation_end:      NaiveDate::from_ymd_opt(2026, 3, 31).unwrap_or_default(),
                purge_label_overlap: false,
            },
            run: RunConfig { batch_size: 64, workers: 1, top_drivers: 3 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_test_config_is_valid() {
        PipelineConfig::default_test().validate().unwrap();
    }

    #[test]
    fn non_increasing_windows_are_rejected() {
        let mut cfg = PipelineConfig::default_test();
        cfg.features.windows.medium_days = cfg.features.windows.short_days;
        assert!(matches!(cfg.validate(), Err(ChurnError::Config(_))));
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let mut cfg = PipelineConfig::default_test();
        cfg.features.windows.year_days = 200_000_000;
        assert!(matches!(cfg.validate(), Err(ChurnError::Config(_))));

        cfg.features.windows.year_days = MAX_WINDOW_DAYS;
        cfg.validate().unwrap();

        cfg.labels.horizon_days = Some(MAX_WINDOW_DAYS + 1);
        assert!(matches!(cfg.validate(), Err(ChurnError::Config(_))));
    }

    #[test]
    fn split_cutoffs_must_be_ordered() {
        let mut cfg = PipelineConfig::default_test();
        cfg.labels.validation_end = cfg.labels.train_end;
        assert!(matches!(cfg.validate(), Err(ChurnError::Config(_))));
    }

    #[test]
    fn gapped_tier_file_fails_to_parse() {
        let json = r#"{"bands":[
            {"tier":"low","lower":0.0,"upper":0.4},
            {"tier":"medium","lower":0.45,"upper":0.6},
            {"tier":"high","lower":0.6,"upper":0.8},
            {"tier":"critical","lower":0.8,"upper":1.0}
        ]}"#;
        let parsed: Result<TierBoundaries, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }
}
