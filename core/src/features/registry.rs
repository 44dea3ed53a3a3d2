//! Versioned feature-definition registry.
//!
//! Each definition declares its category, source table, value kind,
//! lookback window, required inputs, and the fill used when a model
//! matrix needs a number for a null. The canonical JSON of the whole
//! registry is what a schema version pins: if it changes, the version
//! must change too (the store rejects a silent redefinition).

use super::{compound::CompoundRule, FeatureRow, FeatureValue};
use crate::{config::FeatureConfig, types::SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    Coverage,
    Lifecycle,
    Market,
    Volatility,
    Behavioral,
    /// Resolved after every base feature of the same row.
    Compound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    Profiles,
    Contracts,
    Consumption,
    Billing,
    TariffPrices,
    BenchmarkPrices,
    Interactions,
    /// Computed from other features of the same row.
    Derived,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Numeric,
    Flag,
    Category,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureDefinition {
    pub name:        String,
    pub category:    FeatureCategory,
    pub source:      SourceTable,
    pub kind:        ValueKind,
    /// Trailing window ending on the as-of date, if the feature is windowed.
    pub window_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires:    Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule:        Option<CompoundRule>,
    /// Model-matrix value for a null.
    pub fill:        f64,
}

/// Name of a windowed feature: `consumption_mean` + 90 → `consumption_mean_90d`.
pub fn windowed(base: &str, days: u32) -> String {
    format!("{base}_{days}d")
}

#[derive(Debug, Clone, Serialize)]
struct CanonicalRegistry<'a> {
    schema_version:       &'a str,
    renewal_soon_days:    i64,
    price_change_epsilon: f64,
    definitions:          &'a [FeatureDefinition],
}

#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    schema_version:       SchemaVersion,
    renewal_soon_days:    i64,
    price_change_epsilon: f64,
    definitions:          Vec<FeatureDefinition>,
    index:                BTreeMap<String, usize>,
}

/// Sentinel for "days until/since" features that have no event.
pub const DAYS_SENTINEL: f64 = 9999.0;

struct Def {
    defs: Vec<FeatureDefinition>,
}

impl Def {
    fn add(&mut self, name: impl Into<String>, category: FeatureCategory, source: SourceTable,
           kind: ValueKind, window_days: Option<u32>, fill: f64) {
        self.defs.push(FeatureDefinition {
            name: name.into(), category, source, kind, window_days,
            requires: Vec::new(), rule: None, fill,
        });
    }

    fn compound(&mut self, name: &str, kind: ValueKind, rule: CompoundRule, requires: &[&str]) {
        self.defs.push(FeatureDefinition {
            name:        name.into(),
            category:    FeatureCategory::Compound,
            source:      SourceTable::Derived,
            kind,
            window_days: None,
            requires:    requires.iter().map(|r| r.to_string()).collect(),
            rule:        Some(rule),
            fill:        0.0,
        });
    }
}

impl FeatureRegistry {
    /// The standard feature set, with window lengths from `cfg` and any
    /// `cfg.disabled` names left out.
    pub fn standard(cfg: &FeatureConfig) -> Self {
        use FeatureCategory as C;
        use SourceTable as S;
        use ValueKind as K;

        let (s, m, l, y) = (cfg.windows.short_days, cfg.windows.medium_days,
                            cfg.windows.long_days, cfg.windows.year_days);
        let mut d = Def { defs: Vec::new() };

        d.add("no_coverage", C::Coverage, S::Derived, K::Flag, None, 0.0);
        d.add("no_profile", C::Coverage, S::Profiles, K::Flag, None, 0.0);

        d.add("tenure_days", C::Lifecycle, S::Contracts, K::Numeric, None, 0.0);
        d.add("tenure_months", C::Lifecycle, S::Contracts, K::Numeric, None, 0.0);
        d.add("tenure_bucket", C::Lifecycle, S::Contracts, K::Category, None, 0.0);
        d.add("days_to_renewal", C::Lifecycle, S::Contracts, K::Numeric, None, DAYS_SENTINEL);
        d.add("months_to_renewal", C::Lifecycle, S::Contracts, K::Numeric, None, 999.0);
        d.add("renewal_bucket", C::Lifecycle, S::Contracts, K::Category, None, 0.0);
        d.add("is_within_3m_of_renewal", C::Lifecycle, S::Contracts, K::Flag, None, 0.0);
        d.add("is_expired_contract", C::Lifecycle, S::Contracts, K::Flag, None, 0.0);
        d.add("contract_term_months", C::Lifecycle, S::Contracts, K::Numeric, None, 0.0);
        d.add("contract_term_bucket", C::Lifecycle, S::Contracts, K::Category, None, 0.0);
        d.add("active_contract_count", C::Lifecycle, S::Contracts, K::Numeric, None, 0.0);
        d.add("multiple_active_contracts", C::Lifecycle, S::Contracts, K::Flag, None, 0.0);
        d.add("no_contract", C::Lifecycle, S::Contracts, K::Flag, None, 0.0);
        d.add("segment", C::Lifecycle, S::Profiles, K::Category, None, 0.0);
        d.add("sales_channel", C::Lifecycle, S::Profiles, K::Category, None, 0.0);
        d.add("is_comparison_channel", C::Lifecycle, S::Profiles, K::Flag, None, 0.0);
        d.add("is_own_website_channel", C::Lifecycle, S::Profiles, K::Flag, None, 0.0);
        d.add("is_digital_channel", C::Lifecycle, S::Profiles, K::Flag, None, 0.0);

        d.add("latest_tariff_price", C::Market, S::TariffPrices, K::Numeric, None, 0.0);
        d.add("latest_benchmark_price", C::Market, S::BenchmarkPrices, K::Numeric, None, 0.0);
        d.add("price_delta_vs_benchmark", C::Market, S::TariffPrices, K::Numeric, None, 0.0);
        d.add("price_delta_pct_vs_benchmark", C::Market, S::TariffPrices, K::Numeric, None, 0.0);
        d.add(windowed("price_change_count", y), C::Market, S::TariffPrices, K::Numeric, Some(y), 0.0);
        d.add("no_price", C::Market, S::TariffPrices, K::Flag, None, 0.0);
        d.add("is_dual_fuel", C::Market, S::Contracts, K::Flag, None, 0.0);
        d.add("portfolio_type", C::Market, S::Contracts, K::Category, None, 0.0);

        for days in [m, l] {
            d.add(windowed("consumption_mean", days), C::Volatility, S::Consumption, K::Numeric, Some(days), 0.0);
            d.add(windowed("consumption_std", days), C::Volatility, S::Consumption, K::Numeric, Some(days), 0.0);
            d.add(windowed("consumption_trend", days), C::Volatility, S::Consumption, K::Numeric, Some(days), 0.0);
        }
        d.add(windowed("consumption_cv", m), C::Volatility, S::Consumption, K::Numeric, Some(m), 0.0);
        d.add(windowed("consumption_coverage", m), C::Volatility, S::Consumption, K::Numeric, Some(m), 0.0);
        d.add(windowed("negative_reading_days", m), C::Volatility, S::Consumption, K::Numeric, Some(m), 0.0);
        d.add("no_history", C::Volatility, S::Consumption, K::Flag, None, 0.0);
        d.add(windowed("margin_mean", l), C::Volatility, S::Billing, K::Numeric, Some(l), 0.0);
        d.add(windowed("margin_std", l), C::Volatility, S::Billing, K::Numeric, Some(l), 0.0);
        d.add(windowed("margin_trend", l), C::Volatility, S::Billing, K::Numeric, Some(l), 0.0);
        d.add("avg_monthly_margin", C::Volatility, S::Billing, K::Numeric, Some(y), 0.0);
        d.add("no_margin_history", C::Volatility, S::Billing, K::Flag, None, 0.0);

        for days in [s, m, y] {
            d.add(windowed("interaction_count", days), C::Behavioral, S::Interactions, K::Numeric, Some(days), 0.0);
        }
        d.add(windowed("complaint_count", m), C::Behavioral, S::Interactions, K::Numeric, Some(m), 0.0);
        d.add(windowed("negative_sentiment_count", m), C::Behavioral, S::Interactions, K::Numeric, Some(m), 0.0);
        d.add(windowed("has_cancel_intent", m), C::Behavioral, S::Interactions, K::Flag, Some(m), 0.0);
        d.add("days_since_last_interaction", C::Behavioral, S::Interactions, K::Numeric, None, DAYS_SENTINEL);
        d.add("last_sentiment", C::Behavioral, S::Interactions, K::Category, None, 0.0);
        d.add("last_intent", C::Behavioral, S::Interactions, K::Category, None, 0.0);
        d.add("no_interaction", C::Behavioral, S::Interactions, K::Flag, None, 0.0);

        let complaints = windowed("complaint_count", m);
        let negative = windowed("negative_sentiment_count", m);
        d.compound("renewal_x_complaint", K::Flag, CompoundRule::AllTrue,
                   &["is_within_3m_of_renewal", complaints.as_str()]);
        d.compound("renewal_x_negative_sentiment", K::Flag, CompoundRule::AllTrue,
                   &["is_within_3m_of_renewal", negative.as_str()]);
        d.compound("above_benchmark_x_renewal", K::Flag, CompoundRule::AllTrue,
                   &["price_delta_vs_benchmark", "is_within_3m_of_renewal"]);
        d.compound("intent_x_renewal_bucket", K::Category, CompoundRule::Cross,
                   &["last_intent", "renewal_bucket"]);
        d.compound("intent_x_tenure_bucket", K::Category, CompoundRule::Cross,
                   &["last_intent", "tenure_bucket"]);
        d.compound("sentiment_x_renewal_bucket", K::Category, CompoundRule::Cross,
                   &["last_sentiment", "renewal_bucket"]);
        d.compound("tenure_x_renewal_bucket", K::Category, CompoundRule::Cross,
                   &["tenure_bucket", "renewal_bucket"]);
        d.compound("is_price_sensitive", K::Flag, CompoundRule::Equals("pricing_offers".into()),
                   &["last_intent"]);

        let definitions: Vec<FeatureDefinition> = d.defs.into_iter()
            .filter(|def| !cfg.disabled.contains(&def.name))
            .collect();
        Self::from_definitions(cfg, definitions)
    }

    fn from_definitions(cfg: &FeatureConfig, definitions: Vec<FeatureDefinition>) -> Self {
        let index = definitions.iter().enumerate().map(|(i, d)| (d.name.clone(), i)).collect();
        Self {
            schema_version:       cfg.schema_version.clone(),
            renewal_soon_days:    cfg.renewal_soon_days,
            price_change_epsilon: cfg.price_change_epsilon,
            definitions,
            index,
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Definitions in declaration order.
    pub fn definitions(&self) -> &[FeatureDefinition] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&FeatureDefinition> {
        self.index.get(name).map(|&i| &self.definitions[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn compound_definitions(&self) -> impl Iterator<Item = &FeatureDefinition> {
        self.definitions.iter().filter(|d| d.category == FeatureCategory::Compound)
    }

    /// Numeric encoding of a row for a model: numbers as-is, flags as 0/1,
    /// categories one-hot as `name=value`, nulls as the declared fill.
    /// A null category encodes as `name=<null reason>`.
    pub fn encode(&self, row: &FeatureRow) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for def in &self.definitions {
            match (row.get(&def.name), def.kind) {
                (Some(FeatureValue::Category(c)), _) => {
                    out.insert(format!("{}={c}", def.name), 1.0);
                }
                (Some(FeatureValue::Null(reason)), ValueKind::Category) => {
                    out.insert(format!("{}={}", def.name, reason.as_str()), 1.0);
                }
                (Some(v), _) => {
                    out.insert(def.name.clone(), v.as_f64().unwrap_or(def.fill));
                }
                (None, ValueKind::Category) => {}
                (None, _) => {
                    out.insert(def.name.clone(), def.fill);
                }
            }
        }
        out
    }

    pub fn canonical_definition_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&CanonicalRegistry {
            schema_version:       &self.schema_version,
            renewal_soon_days:    self.renewal_soon_days,
            price_change_epsilon: self.price_change_epsilon,
            definitions:          &self.definitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn names_are_unique_and_windows_follow_config() {
        let cfg = PipelineConfig::default_test().features;
        let reg = FeatureRegistry::standard(&cfg);
        assert_eq!(reg.index.len(), reg.definitions.len(), "duplicate feature names");
        assert_eq!(reg.get("consumption_std_90d").and_then(|d| d.window_days), Some(90));
        assert!(reg.contains("interaction_count_30d"));
        assert!(reg.contains("price_change_count_365d"));
    }

    #[test]
    fn compound_inputs_are_declared_features() {
        let cfg = PipelineConfig::default_test().features;
        let reg = FeatureRegistry::standard(&cfg);
        for def in reg.compound_definitions() {
            assert!(!def.requires.is_empty(), "{} declares no inputs", def.name);
            for input in &def.requires {
                assert!(reg.contains(input), "{} requires unknown {input}", def.name);
            }
        }
    }

    #[test]
    fn disabling_a_feature_changes_the_canonical_definition() {
        let cfg = PipelineConfig::default_test().features;
        let full = FeatureRegistry::standard(&cfg).canonical_definition_json().unwrap();
        let mut trimmed = cfg.clone();
        trimmed.disabled.push("last_intent".into());
        let reg = FeatureRegistry::standard(&trimmed);
        assert!(!reg.contains("last_intent"));
        assert_ne!(full, reg.canonical_definition_json().unwrap());
    }
}
