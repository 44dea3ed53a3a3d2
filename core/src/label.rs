//! Label joiner and temporal splitter.
//!
//! Builds a training set from feature rows and label rows:
//!   1. drop unusable labels (outcome not 0/1, effective date not after
//!      the label's as-of date), counted
//!   2. settle the horizon: the configured one, or the only one present;
//!      several with none configured is fatal
//!   3. reject duplicate keys on either side and mixed schema versions
//!   4. inner join on (entity_id, asof_date), counting both unmatched sides
//!   5. split by as-of date against the configured cutoffs
//!   6. optionally purge examples whose label window crosses their cutoff
//!
//! No randomness anywhere: identical inputs give identical sets.

use crate::{
    config::LabelConfig,
    error::{ChurnError, ChurnResult},
    features::{registry::FeatureRegistry, FeatureRow},
    types::{Date, EntityId},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelRow {
    pub entity_id:       EntityId,
    pub label_asof_date: Date,
    pub horizon_days:    u32,
    /// Must be 0 or 1; anything else is excluded at join time.
    pub outcome:         i64,
    #[serde(default)]
    pub effective_date:  Option<Date>,
}

impl LabelRow {
    pub fn load_all(path: &str) -> ChurnResult<Vec<Self>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train      => "train",
            Self::Validation => "validation",
            Self::Test       => "test",
        }
    }
}

/// Date-only split rule. Cutoffs are inclusive.
pub fn assign_split(asof: Date, cfg: &LabelConfig) -> Split {
    if asof <= cfg.train_end {
        Split::Train
    } else if asof <= cfg.validation_end {
        Split::Validation
    } else {
        Split::Test
    }
}

fn split_cutoff(split: Split, cfg: &LabelConfig) -> Option<Date> {
    match split {
        Split::Train      => Some(cfg.train_end),
        Split::Validation => Some(cfg.validation_end),
        Split::Test       => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub features:       FeatureRow,
    pub outcome:        u8,
    pub effective_date: Option<Date>,
    pub split:          Split,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinReport {
    pub feature_rows:       usize,
    pub label_rows:         usize,
    pub invalid_outcome:    usize,
    pub invalid_effective:  usize,
    pub other_horizon:      usize,
    pub unmatched_features: usize,
    pub unmatched_labels:   usize,
    pub purged:             usize,
    pub per_split:          BTreeMap<Split, usize>,
}

#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub schema_version: String,
    pub horizon_days:   u32,
    /// Sorted by (asof_date, entity_id).
    pub examples:       Vec<TrainingExample>,
    pub report:         JoinReport,
}

/// Dense numeric view of a training set.
#[derive(Debug, Clone)]
pub struct ModelMatrix {
    pub columns:    Vec<String>,
    pub rows:       Vec<Vec<f64>>,
    pub outcomes:   Vec<u8>,
    pub splits:     Vec<Split>,
    pub entity_ids: Vec<EntityId>,
}

impl TrainingSet {
    pub fn split_of(&self, entity_id: &str, asof: Date) -> Option<Split> {
        self.examples.iter()
            .find(|e| e.features.entity_id() == entity_id && e.features.asof_date() == asof)
            .map(|e| e.split)
    }

    /// Columns are the registry's encoded names, in sorted order; a one-hot
    /// column absent from a row is 0.
    pub fn model_matrix(&self, registry: &FeatureRegistry) -> ModelMatrix {
        let encoded: Vec<BTreeMap<String, f64>> = self.examples.iter()
            .map(|e| registry.encode(&e.features))
            .collect();
        let columns: Vec<String> = encoded.iter()
            .flat_map(|m| m.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let rows = encoded.iter()
            .map(|m| columns.iter().map(|c| m.get(c).copied().unwrap_or(0.0)).collect())
            .collect();
        ModelMatrix {
            columns,
            rows,
            outcomes:   self.examples.iter().map(|e| e.outcome).collect(),
            splits:     self.examples.iter().map(|e| e.split).collect(),
            entity_ids: self.examples.iter().map(|e| e.features.entity_id().to_string()).collect(),
        }
    }
}

pub struct LabelJoiner<'a> {
    cfg: &'a LabelConfig,
}

impl<'a> LabelJoiner<'a> {
    pub fn new(cfg: &'a LabelConfig) -> Self {
        Self { cfg }
    }

    pub fn build(&self, rows: &[FeatureRow], labels: &[LabelRow]) -> ChurnResult<TrainingSet> {
        let mut report = JoinReport {
            feature_rows: rows.len(),
            label_rows:   labels.len(),
            ..Default::default()
        };

        // 1. usable labels
        let mut usable: Vec<&LabelRow> = Vec::with_capacity(labels.len());
        for l in labels {
            if l.outcome != 0 && l.outcome != 1 {
                report.invalid_outcome += 1;
                continue;
            }
            if l.effective_date.is_some_and(|eff| eff <= l.label_asof_date) {
                report.invalid_effective += 1;
                continue;
            }
            usable.push(l);
        }
        if report.invalid_outcome + report.invalid_effective > 0 {
            log::warn!(
                "labels: excluded {} unusable label row(s) (outcome={}, effective_date={})",
                report.invalid_outcome + report.invalid_effective,
                report.invalid_outcome, report.invalid_effective
            );
        }

        // 2. horizon
        let horizons: BTreeSet<u32> = usable.iter().map(|l| l.horizon_days).collect();
        let horizon = match self.cfg.horizon_days {
            Some(h) => h,
            None if horizons.len() > 1 => {
                return Err(ChurnError::HorizonAmbiguity { horizons: horizons.into_iter().collect() });
            }
            None => match horizons.iter().next() {
                Some(h) => *h,
                None => {
                    return Err(ChurnError::NoEligibleEntities {
                        stage:   "training_set".into(),
                        context: "no usable label rows".into(),
                    });
                }
            },
        };
        let before = usable.len();
        usable.retain(|l| l.horizon_days == horizon);
        report.other_horizon = before - usable.len();

        // 3. keys and versions
        let mut by_key: BTreeMap<(&str, Date), &LabelRow> = BTreeMap::new();
        for l in usable {
            if by_key.insert((l.entity_id.as_str(), l.label_asof_date), l).is_some() {
                return Err(ChurnError::DuplicateLabel {
                    entity_id:    l.entity_id.clone(),
                    asof:         l.label_asof_date,
                    horizon_days: horizon,
                });
            }
        }
        let versions: BTreeSet<&str> = rows.iter().map(|r| r.schema_version()).collect();
        if versions.len() > 1 {
            return Err(ChurnError::MixedSchemaVersions {
                versions: versions.into_iter().map(String::from).collect(),
            });
        }
        let mut seen: BTreeSet<(&str, Date)> = BTreeSet::new();
        for r in rows {
            if !seen.insert((r.entity_id(), r.asof_date())) {
                return Err(ChurnError::DuplicateFeatureRow {
                    entity_id: r.entity_id().to_string(),
                    asof:      r.asof_date(),
                });
            }
        }

        // 4. inner join, 5. split, 6. purge
        let mut matched: BTreeSet<(&str, Date)> = BTreeSet::new();
        let mut examples = Vec::new();
        for r in rows {
            let key = (r.entity_id(), r.asof_date());
            let Some(label) = by_key.get(&key) else {
                report.unmatched_features += 1;
                continue;
            };
            matched.insert(key);
            let split = assign_split(r.asof_date(), self.cfg);
            if self.cfg.purge_label_overlap {
                let label_end = r.asof_date()
                    .checked_add_signed(Duration::days(i64::from(horizon)))
                    .unwrap_or(Date::MAX);
                if split_cutoff(split, self.cfg).is_some_and(|cutoff| label_end > cutoff) {
                    report.purged += 1;
                    continue;
                }
            }
            *report.per_split.entry(split).or_default() += 1;
            examples.push(TrainingExample {
                features:       r.clone(),
                outcome:        if label.outcome == 1 { 1 } else { 0 },
                effective_date: label.effective_date,
                split,
            });
        }
        report.unmatched_labels = by_key.len() - matched.len();

        if report.unmatched_features > 0 {
            log::info!("labels: {} feature row(s) had no label and were left out", report.unmatched_features);
        }
        if report.purged > 0 {
            log::info!("labels: purged {} example(s) whose {horizon}d label window crosses its split cutoff", report.purged);
        }

        if examples.is_empty() {
            return Err(ChurnError::NoEligibleEntities {
                stage:   "training_set".into(),
                context: format!("no feature row matched a {horizon}d label"),
            });
        }

        examples.sort_by(|a, b| {
            (a.features.asof_date(), a.features.entity_id())
                .cmp(&(b.features.asof_date(), b.features.entity_id()))
        });

        let schema_version = examples[0].features.schema_version().to_string();
        log::info!(
            "labels: training set schema={schema_version} horizon={horizon}d examples={} per_split={:?}",
            examples.len(), report.per_split
        );
        Ok(TrainingSet { schema_version, horizon_days: horizon, examples, report })
    }
}
