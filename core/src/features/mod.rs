//! Feature rows and the per-category calculators that fill them.
//!
//! Calculators receive an `asof::EntityView` only. They never see raw
//! sources, so they cannot read past the as-of date.

pub mod assembler;
pub mod behavioral;
pub mod compound;
pub mod lifecycle;
pub mod market;
pub mod registry;
pub mod volatility;

use crate::{
    event::RunEvent,
    types::{Date, EntityId, SchemaVersion},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why a feature carries no value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NullReason {
    NoContract,
    NoProfile,
    NoHistory,
    NoPrice,
    NoInteraction,
    /// A contract exists but carries no end date.
    OpenEnded,
    /// Some history, but too little for the statistic (e.g. std of one point).
    InsufficientData,
    /// An input the feature declares is not part of this schema version.
    Unavailable,
}

impl NullReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoContract       => "no_contract",
            Self::NoProfile        => "no_profile",
            Self::NoHistory        => "no_history",
            Self::NoPrice          => "no_price",
            Self::NoInteraction    => "no_interaction",
            Self::OpenEnded        => "open_ended",
            Self::InsufficientData => "insufficient_data",
            Self::Unavailable      => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FeatureValue {
    Numeric(f64),
    Flag(bool),
    Category(String),
    Null(NullReason),
}

impl FeatureValue {
    /// Non-finite results never reach a row.
    pub fn numeric(v: f64) -> Self {
        if v.is_finite() { Self::Numeric(v) } else { Self::Null(NullReason::InsufficientData) }
    }

    pub fn numeric_or(v: Option<f64>, reason: NullReason) -> Self {
        v.map(Self::numeric).unwrap_or(Self::Null(reason))
    }

    pub fn category_or(v: Option<String>, reason: NullReason) -> Self {
        v.map(Self::Category).unwrap_or(Self::Null(reason))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            Self::Flag(b)    => Some(if *b { 1.0 } else { 0.0 }),
            _                => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _             => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            Self::Category(s) => Some(s.as_str()),
            _                 => None,
        }
    }
}

/// One entity's features at one as-of date under one schema version.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    entity_id:      EntityId,
    asof_date:      Date,
    schema_version: SchemaVersion,
    values:         BTreeMap<String, FeatureValue>,
}

impl FeatureRow {
    pub fn new(
        entity_id: EntityId,
        asof_date: Date,
        schema_version: SchemaVersion,
        values: BTreeMap<String, FeatureValue>,
    ) -> Self {
        Self { entity_id, asof_date, schema_version, values }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn asof_date(&self) -> Date {
        self.asof_date
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn values(&self) -> &BTreeMap<String, FeatureValue> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FeatureValue::as_f64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(FeatureValue::as_bool)
    }

    pub fn category(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FeatureValue::as_category)
    }

    /// Sorted-key JSON of the value map. Identical inputs give identical bytes.
    pub fn canonical_values_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.values)
    }
}

/// Scratch space for one row while calculators run.
#[derive(Debug, Default)]
pub struct RowBuilder {
    values: BTreeMap<String, FeatureValue>,
    events: Vec<RunEvent>,
}

impl RowBuilder {
    pub fn set(&mut self, name: impl Into<String>, value: FeatureValue) {
        self.values.insert(name.into(), value);
    }

    pub fn num(&mut self, name: impl Into<String>, v: Option<f64>, reason: NullReason) {
        self.set(name, FeatureValue::numeric_or(v, reason));
    }

    pub fn flag(&mut self, name: impl Into<String>, b: bool) {
        self.set(name, FeatureValue::Flag(b));
    }

    pub fn cat(&mut self, name: impl Into<String>, v: Option<String>, reason: NullReason) {
        self.set(name, FeatureValue::category_or(v, reason));
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    pub fn note(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    pub fn into_parts(self) -> (BTreeMap<String, FeatureValue>, Vec<RunEvent>) {
        (self.values, self.events)
    }
}

/// Normalize free-text labels (`Comparison Website` → `comparison_website`).
pub fn normalize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for part in raw.split(|c: char| !c.is_alphanumeric()).filter(|p| !p.is_empty()) {
        if !out.is_empty() {
            out.push('_');
        }
        out.push_str(&part.to_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_serialize_with_kind_tags() {
        let mut values = BTreeMap::new();
        values.insert("b".to_string(), FeatureValue::Flag(true));
        values.insert("a".to_string(), FeatureValue::Null(NullReason::NoHistory));
        let row = FeatureRow::new("C1".into(), Date::default(), "v1".into(), values);
        assert_eq!(
            row.canonical_values_json().unwrap(),
            r#"{"a":{"type":"null","value":"no_history"},"b":{"type":"flag","value":true}}"#
        );
    }

    #[test]
    fn non_finite_numbers_become_null() {
        assert_eq!(FeatureValue::numeric(f64::INFINITY), FeatureValue::Null(NullReason::InsufficientData));
    }

    #[test]
    fn labels_normalize() {
        assert_eq!(normalize_label("Comparison Website"), "comparison_website");
        assert_eq!(normalize_label("  Pricing-Offers "), "pricing_offers");
    }
}
