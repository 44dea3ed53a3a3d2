use super::{registry::windowed, NullReason, RowBuilder};
use crate::{asof::EntityView, config::FeatureConfig, grain::{aggregate, SeriesSpec}};

pub fn compute(view: &EntityView<'_>, cfg: &FeatureConfig, row: &mut RowBuilder) {
    let tariff = view.tariff().last().map(|p| p.value);
    let benchmark = view.benchmark().last().map(|p| p.value);

    row.flag("no_price", tariff.is_none());
    row.num("latest_tariff_price", tariff, NullReason::NoPrice);
    row.num("latest_benchmark_price", benchmark, NullReason::NoPrice);

    let delta = tariff.zip(benchmark).map(|(t, b)| t - b);
    row.num("price_delta_vs_benchmark", delta, NullReason::NoPrice);
    let pct = tariff.zip(benchmark).filter(|(_, b)| *b != 0.0).map(|(t, b)| (t - b) / b);
    row.num("price_delta_pct_vs_benchmark", pct, NullReason::NoPrice);

    // Price changes between consecutive days within the trailing year.
    let year = cfg.windows.year_days;
    let name = windowed("price_change_count", year);
    let window = view.trailing(view.tariff(), year);
    let changes = match aggregate(&SeriesSpec::daily_price(), window, None) {
        Ok(agg) => {
            let daily: Vec<f64> = agg.observed().into_iter().map(|(_, v)| v).collect();
            Some(daily.windows(2).filter(|w| (w[1] - w[0]).abs() > cfg.price_change_epsilon).count() as f64)
        }
        Err(e) => {
            log::warn!("asof={} features: {} price series skipped: {e}", view.asof, view.entity_id);
            None
        }
    };
    row.num(name, if window.is_empty() { None } else { changes }, NullReason::NoPrice);
}
