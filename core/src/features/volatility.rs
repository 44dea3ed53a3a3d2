//! Trailing-window level, volatility and trend of consumption and margin.
//!
//! Consumption is rolled up to daily totals and margin to monthly totals
//! through the grain aggregator before any statistic is taken. Gaps stay
//! gaps: statistics run over observed buckets only.

use super::{registry::windowed, NullReason, RowBuilder};
use crate::{
    asof::{window_start, EntityView},
    config::FeatureConfig,
    grain::{aggregate, mean, ols_slope, sample_std, AggregationReport, SeriesSpec, TimedValue},
    types::Timestamp,
};
use chrono::NaiveTime;

struct WindowStats {
    mean:     Option<f64>,
    std:      Option<f64>,
    trend:    Option<f64>,
    observed: usize,
    negative: usize,
    report:   AggregationReport,
}

/// Why a statistic over `n` points is missing, given whether the entity
/// has any history at all.
fn reason(has_history: bool, n: usize) -> NullReason {
    if !has_history || n == 0 { NullReason::NoHistory } else { NullReason::InsufficientData }
}

fn window_stats(
    view: &EntityView<'_>,
    spec: &SeriesSpec,
    series: &[TimedValue],
    days: u32,
) -> WindowStats {
    let points = view.trailing(series, days);
    let lo = window_start(view.asof, days).and_time(NaiveTime::MIN);
    let hi = view.asof.and_time(NaiveTime::MIN);
    let agg = match aggregate(spec, points, Some((lo, hi))) {
        Ok(agg) => agg,
        Err(e) => {
            log::warn!("asof={} features: {} series '{}' skipped: {e}", view.asof, view.entity_id, spec.name);
            return WindowStats {
                mean: None, std: None, trend: None, observed: 0, negative: 0,
                report: AggregationReport::default(),
            };
        }
    };

    let observed = agg.observed();
    let values: Vec<f64> = observed.iter().map(|(_, v)| *v).collect();
    let origin = lo;
    let xy: Vec<(f64, f64)> = observed.iter().map(|(ts, v)| (bucket_index(spec, origin, *ts), *v)).collect();

    WindowStats {
        mean:     mean(&values),
        std:      sample_std(&values),
        trend:    ols_slope(&xy),
        observed: values.len(),
        negative: agg.buckets.iter().filter(|b| b.negative_value).count(),
        report:   agg.report,
    }
}

/// Position of a bucket on the x axis of a trend: days for daily series,
/// months for monthly ones.
fn bucket_index(spec: &SeriesSpec, origin: Timestamp, ts: Timestamp) -> f64 {
    use crate::grain::Grain;
    use chrono::Datelike;
    match spec.target_grain {
        Grain::Monthly => {
            let months = |t: Timestamp| t.year() as i64 * 12 + t.month0() as i64;
            (months(ts) - months(origin)) as f64
        }
        Grain::Daily   => (ts - origin).num_days() as f64,
        Grain::Hourly  => (ts - origin).num_hours() as f64,
    }
}

/// Returns the aggregation counts of the widest window of each series.
pub fn compute(view: &EntityView<'_>, cfg: &FeatureConfig, row: &mut RowBuilder) -> AggregationReport {
    let mut report = AggregationReport::default();
    let w = &cfg.windows;

    // Consumption
    let consumption = view.consumption();
    let has_consumption = !consumption.is_empty();
    row.flag("no_history", !has_consumption);
    let spec = SeriesSpec::daily_consumption();
    for days in [w.medium_days, w.long_days] {
        let s = window_stats(view, &spec, consumption, days);
        if days == w.long_days {
            report.absorb(&s.report);
        }
        row.num(windowed("consumption_mean", days), s.mean, reason(has_consumption, s.observed));
        row.num(windowed("consumption_std", days), s.std, reason(has_consumption, s.observed));
        row.num(windowed("consumption_trend", days), s.trend, reason(has_consumption, s.observed));

        if days == w.medium_days {
            let cv = s.mean.zip(s.std).filter(|(m, _)| *m > 0.0).map(|(m, sd)| sd / m);
            row.num(windowed("consumption_cv", days), cv, reason(has_consumption, s.observed));
            let coverage = has_consumption.then(|| s.observed as f64 / f64::from(days));
            row.num(windowed("consumption_coverage", days), coverage, NullReason::NoHistory);
            let negative = has_consumption.then_some(s.negative as f64);
            row.num(windowed("negative_reading_days", days), negative, NullReason::NoHistory);
        }
    }

    // Margin
    let margin = view.margin();
    let has_margin = !margin.is_empty();
    row.flag("no_margin_history", !has_margin);
    let spec = SeriesSpec::monthly_margin();
    let s = window_stats(view, &spec, margin, w.long_days);
    row.num(windowed("margin_mean", w.long_days), s.mean, reason(has_margin, s.observed));
    row.num(windowed("margin_std", w.long_days), s.std, reason(has_margin, s.observed));
    row.num(windowed("margin_trend", w.long_days), s.trend, reason(has_margin, s.observed));

    let year = window_stats(view, &spec, margin, w.year_days);
    report.absorb(&year.report);
    row.num("avg_monthly_margin", year.mean, reason(has_margin, year.observed));

    report
}
