//! Time-grain aggregator — collapses one entity's timestamped series into
//! per-period summaries at a declared target grain.
//!
//! Every series declares its policies up front in a `SeriesSpec`:
//!   - source and target grain (target must be equal or coarser)
//!   - how source-grain key collisions resolve (sum or last-wins)
//!   - what a missing period means (no data, or a true zero)
//!   - whether the domain is non-negative (negatives are flagged, never dropped)
//!
//! Nothing is inferred from the data itself.

use crate::{
    error::{ChurnError, ChurnResult},
    sources::last_day_of_month,
    types::Timestamp,
};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Grain {
    Hourly,
    Daily,
    Monthly,
}

impl Grain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly  => "hourly",
            Self::Daily   => "daily",
            Self::Monthly => "monthly",
        }
    }

    /// Truncate a timestamp to the start of its bucket.
    pub fn bucket(&self, ts: Timestamp) -> Timestamp {
        match self {
            Self::Hourly => ts.date().and_hms_opt(ts.hour(), 0, 0).unwrap_or(ts),
            Self::Daily  => ts.date().and_time(NaiveTime::MIN),
            Self::Monthly => NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1)
                .map(|d| d.and_time(NaiveTime::MIN))
                .unwrap_or(ts),
        }
    }

    /// The bucket start following `bucket_start`.
    pub fn next(&self, bucket_start: Timestamp) -> Timestamp {
        match self {
            Self::Hourly => bucket_start + Duration::hours(1),
            Self::Daily  => bucket_start + Duration::days(1),
            Self::Monthly => last_day_of_month(bucket_start.date())
                .and_then(|d| d.succ_opt())
                .map(|d| d.and_time(NaiveTime::MIN))
                .unwrap_or(bucket_start + Duration::days(31)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    Sum,
    LastWins,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// A gap means the measurement is absent (e.g. a meter outage).
    NoData,
    /// A gap means the quantity was genuinely zero.
    TrueZero,
}

/// How source-grain values fold into one target bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    Sum,
    Mean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSpec {
    pub name:         String,
    pub source_grain: Grain,
    pub target_grain: Grain,
    pub combine:      Combine,
    pub collision:    CollisionPolicy,
    pub missing:      MissingPolicy,
    pub non_negative: bool,
}

impl SeriesSpec {
    /// Hourly meter readings rolled up to daily totals.
    pub fn daily_consumption() -> Self {
        Self {
            name:         "consumption_kwh".into(),
            source_grain: Grain::Hourly,
            target_grain: Grain::Daily,
            combine:      Combine::Sum,
            collision:    CollisionPolicy::LastWins,
            missing:      MissingPolicy::NoData,
            non_negative: true,
        }
    }

    /// Monthly billed margin; corrections within a month add up.
    pub fn monthly_margin() -> Self {
        Self {
            name:         "margin".into(),
            source_grain: Grain::Monthly,
            target_grain: Grain::Monthly,
            combine:      Combine::Sum,
            collision:    CollisionPolicy::Sum,
            missing:      MissingPolicy::NoData,
            non_negative: false,
        }
    }

    /// Daily regional tariff; a restated price replaces the earlier one.
    pub fn daily_price() -> Self {
        Self {
            name:         "tariff_price".into(),
            source_grain: Grain::Daily,
            target_grain: Grain::Daily,
            combine:      Combine::Mean,
            collision:    CollisionPolicy::LastWins,
            missing:      MissingPolicy::NoData,
            non_negative: true,
        }
    }
}

/// One timestamped observation. `seq` is ingestion order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedValue {
    pub ts:    Timestamp,
    pub value: f64,
    pub seq:   usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PeriodValue {
    Observed(f64),
    TrueZero,
    NoData,
}

impl PeriodValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Observed(v) => Some(*v),
            Self::TrueZero    => Some(0.0),
            Self::NoData      => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodAggregate {
    pub period_start:   Timestamp,
    pub value:          PeriodValue,
    /// Source-grain points folded into this bucket (after collision resolution).
    pub count:          usize,
    pub mean:           Option<f64>,
    pub std:            Option<f64>,
    /// Set when any contributing point was negative in a non-negative domain.
    pub negative_value: bool,
    /// Set when the bucket had no points and was filled from the missing policy.
    pub missing:        bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub input_points:    usize,
    pub collisions:      usize,
    pub negative_values: usize,
    pub invalid_values:  usize,
    pub out_of_range:    usize,
    pub missing_periods: usize,
}

impl AggregationReport {
    pub fn absorb(&mut self, other: &AggregationReport) {
        self.input_points    += other.input_points;
        self.collisions      += other.collisions;
        self.negative_values += other.negative_values;
        self.invalid_values  += other.invalid_values;
        self.out_of_range    += other.out_of_range;
        self.missing_periods += other.missing_periods;
    }
}

#[derive(Debug, Clone)]
pub struct SeriesAggregation {
    pub buckets: Vec<PeriodAggregate>,
    pub report:  AggregationReport,
}

impl SeriesAggregation {
    /// Values of every bucket that carries data, in period order.
    pub fn observed(&self) -> Vec<(Timestamp, f64)> {
        self.buckets.iter()
            .filter_map(|b| b.value.value().map(|v| (b.period_start, v)))
            .collect()
    }
}

/// Aggregate one entity's series.
///
/// `range` is an inclusive span of target-grain bucket starts. When given,
/// points outside it are skipped and every bucket inside it is emitted,
/// gaps included; without it only buckets with data are emitted.
pub fn aggregate(
    spec: &SeriesSpec,
    points: &[TimedValue],
    range: Option<(Timestamp, Timestamp)>,
) -> ChurnResult<SeriesAggregation> {
    if spec.target_grain < spec.source_grain {
        return Err(ChurnError::GrainMismatch {
            series: spec.name.clone(),
            from:   spec.source_grain.as_str().into(),
            to:     spec.target_grain.as_str().into(),
        });
    }

    let mut report = AggregationReport { input_points: points.len(), ..Default::default() };

    let range = range.map(|(lo, hi)| (spec.target_grain.bucket(lo), spec.target_grain.bucket(hi)));

    let mut ordered: Vec<&TimedValue> = points.iter().collect();
    ordered.sort_by_key(|p| (p.ts, p.seq));

    // Source-grain dedup: one value per source bucket.
    let mut source: BTreeMap<Timestamp, (f64, bool)> = BTreeMap::new();
    for p in ordered {
        if !p.value.is_finite() {
            report.invalid_values += 1;
            continue;
        }
        let target_start = spec.target_grain.bucket(p.ts);
        if let Some((lo, hi)) = range {
            if target_start < lo || target_start > hi {
                report.out_of_range += 1;
                continue;
            }
        }
        let negative = spec.non_negative && p.value < 0.0;
        if negative {
            report.negative_values += 1;
        }
        let key = spec.source_grain.bucket(p.ts);
        match source.get_mut(&key) {
            Some((v, neg)) => {
                report.collisions += 1;
                match spec.collision {
                    CollisionPolicy::Sum      => *v += p.value,
                    CollisionPolicy::LastWins => *v = p.value,
                }
                *neg |= negative;
            }
            None => {
                source.insert(key, (p.value, negative));
            }
        }
    }

    // Fold source buckets into target buckets.
    let mut target: BTreeMap<Timestamp, (Vec<f64>, bool)> = BTreeMap::new();
    for (ts, (v, neg)) in source {
        let entry = target.entry(spec.target_grain.bucket(ts)).or_default();
        entry.0.push(v);
        entry.1 |= neg;
    }

    let mut buckets = Vec::new();
    match range {
        Some((lo, hi)) => {
            let mut cursor = lo;
            while cursor <= hi {
                match target.remove(&cursor) {
                    Some((values, neg)) => buckets.push(summarize(spec, cursor, &values, neg)),
                    None => {
                        report.missing_periods += 1;
                        buckets.push(gap(spec, cursor));
                    }
                }
                cursor = spec.target_grain.next(cursor);
            }
        }
        None => {
            for (ts, (values, neg)) in target {
                buckets.push(summarize(spec, ts, &values, neg));
            }
        }
    }

    Ok(SeriesAggregation { buckets, report })
}

fn summarize(spec: &SeriesSpec, start: Timestamp, values: &[f64], negative: bool) -> PeriodAggregate {
    let sum: f64 = values.iter().sum();
    let mean = mean(values);
    let value = match spec.combine {
        Combine::Sum  => sum,
        Combine::Mean => mean.unwrap_or(0.0),
    };
    PeriodAggregate {
        period_start:   start,
        value:          PeriodValue::Observed(value),
        count:          values.len(),
        mean,
        std:            sample_std(values),
        negative_value: negative,
        missing:        false,
    }
}

fn gap(spec: &SeriesSpec, start: Timestamp) -> PeriodAggregate {
    let value = match spec.missing {
        MissingPolicy::NoData   => PeriodValue::NoData,
        MissingPolicy::TrueZero => PeriodValue::TrueZero,
    };
    PeriodAggregate {
        period_start:   start,
        value,
        count:          0,
        mean:           None,
        std:            None,
        negative_value: false,
        missing:        true,
    }
}

// ── Summary statistics ───────────────────────────────────────────────────────

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n − 1). None below two points.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Least-squares slope of `y` against `x`. None below two points or
/// when every `x` is equal.
pub fn ols_slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let my = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mx).powi(2)).sum();
    if sxx == 0.0 {
        return None;
    }
    let sxy: f64 = points.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum();
    Some(sxy / sxx)
}
