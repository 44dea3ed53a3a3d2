//! Raw source records, as read from the silver layer.
//!
//! RULE: timestamps stay raw strings here. They are parsed exactly once,
//! by `asof::AsOfSnapshot::build`, which is also where the point-in-time
//! filter is applied. No feature code ever sees a `SourceSnapshot`.

use crate::{
    error::ChurnResult,
    types::{Date, EntityId, Timestamp},
};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Fuel {
    Electricity,
    Gas,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Ended,
    Pending,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral  => "neutral",
            Self::Negative => "negative",
        }
    }
}

/// Static customer attributes. Carries no timestamp; treated as
/// reference data valid for every as-of date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id:   EntityId,
    pub segment:       String,
    #[serde(default)]
    pub sales_channel: Option<String>,
    pub region:        String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRecord {
    pub contract_id: String,
    pub customer_id: EntityId,
    pub start_date:  String,
    #[serde(default)]
    pub end_date:    Option<String>,
    pub status:      ContractStatus,
    pub term_months: u32,
    pub fuel:        Fuel,
}

/// Hourly meter reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterReading {
    pub customer_id: EntityId,
    pub timestamp:   String,
    pub kwh:         f64,
}

/// Daily regional price point (tariff or market benchmark).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub region:    String,
    pub timestamp: String,
    pub price:     f64,
}

/// Monthly billing summary. `period` is either a month (`2026-01`) or a
/// full timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub customer_id: EntityId,
    pub period:      String,
    pub revenue:     f64,
    pub cost:        f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub customer_id: EntityId,
    pub timestamp:   String,
    pub channel:     String,
    pub kind:        String,
    #[serde(default)]
    pub sentiment:   Option<Sentiment>,
    #[serde(default)]
    pub intent:      Option<String>,
}

/// Fully materialized source data for one run. Vector order is
/// ingestion order and is used as the tie-break for equal timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSnapshot {
    #[serde(default)]
    pub customers:        Vec<CustomerProfile>,
    #[serde(default)]
    pub contracts:        Vec<ContractRecord>,
    #[serde(default)]
    pub consumption:      Vec<MeterReading>,
    #[serde(default)]
    pub tariff_prices:    Vec<PricePoint>,
    #[serde(default)]
    pub benchmark_prices: Vec<PricePoint>,
    #[serde(default)]
    pub billing:          Vec<BillingRecord>,
    #[serde(default)]
    pub interactions:     Vec<InteractionRecord>,
}

impl SourceSnapshot {
    /// Read a snapshot from a JSON file.
    pub fn load(path: &str) -> ChurnResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every customer id that appears in at least one source.
    pub fn known_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.customers.iter().map(|c| c.customer_id.clone())
            .chain(self.contracts.iter().map(|c| c.customer_id.clone()))
            .chain(self.consumption.iter().map(|c| c.customer_id.clone()))
            .chain(self.billing.iter().map(|c| c.customer_id.clone()))
            .chain(self.interactions.iter().map(|c| c.customer_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

// ── Timestamp parsing ────────────────────────────────────────────────────────

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a source timestamp. Returns None for anything unparseable;
/// callers count and exclude such records.
///
/// A bare month (`2026-01`) denotes a closed billing period and is
/// stamped at the period's last day, so a month only becomes visible
/// once it has ended.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d.and_time(NaiveTime::MIN));
    }
    parse_month_close(raw).map(|d| d.and_time(NaiveTime::MIN))
}

/// Parse a calendar date, accepting any timestamp form and keeping its day.
pub fn parse_date(raw: &str) -> Option<Date> {
    parse_timestamp(raw).map(|ts| ts.date())
}

fn parse_month_close(raw: &str) -> Option<Date> {
    let (y, m) = raw.split_once('-')?;
    if y.len() != 4 || m.len() != 2 {
        return None;
    }
    let year: i32 = y.parse().ok()?;
    let month: u32 = m.parse().ok()?;
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    last_day_of_month(first)
}

pub(crate) fn last_day_of_month(d: Date) -> Option<Date> {
    let (ny, nm) = if d.month() == 12 { (d.year() + 1, 1) } else { (d.year(), d.month() + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> Date {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_date("2026-02-01"), Some(d(2026, 2, 1)));
        assert_eq!(parse_date("2026-02-01T13:00:00"), Some(d(2026, 2, 1)));
        assert_eq!(parse_date("2026-02-01 23:59:59"), Some(d(2026, 2, 1)));
        assert_eq!(parse_date("2026-02-01T10:00:00Z"), Some(d(2026, 2, 1)));
    }

    #[test]
    fn month_stamps_land_on_period_close() {
        assert_eq!(parse_date("2026-01"), Some(d(2026, 1, 31)));
        assert_eq!(parse_date("2024-02"), Some(d(2024, 2, 29)));
        assert_eq!(parse_date("2025-12"), Some(d(2025, 12, 31)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2026-13-01"), None);
        assert_eq!(parse_timestamp("2026-1"), None);
    }
}
