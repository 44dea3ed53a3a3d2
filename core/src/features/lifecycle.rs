//! Lifecycle and profile features, from contract state on the as-of date.

use super::{normalize_label, NullReason, RowBuilder};
use crate::{asof::EntityView, config::FeatureConfig, event::RunEvent, sources::Fuel};

const DAYS_PER_MONTH: f64 = 30.44;

pub fn tenure_bucket(months: f64) -> &'static str {
    match months {
        m if m <= 6.0  => "0-6m",
        m if m <= 12.0 => "6-12m",
        m if m <= 24.0 => "1-2y",
        m if m <= 60.0 => "2-5y",
        _              => "5y+",
    }
}

pub fn renewal_bucket(months: f64) -> &'static str {
    match months {
        m if m <= 0.0  => "expired",
        m if m <= 1.0  => "0-1m",
        m if m <= 3.0  => "1-3m",
        m if m <= 6.0  => "3-6m",
        m if m <= 12.0 => "6-12m",
        _              => "12m+",
    }
}

pub fn term_bucket(term_months: u32) -> &'static str {
    match term_months {
        0..=12  => "short",
        13..=24 => "standard",
        _       => "long",
    }
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

pub fn compute(view: &EntityView<'_>, cfg: &FeatureConfig, row: &mut RowBuilder) {
    compute_profile(view, row);

    let asof = view.asof;
    let contracts = view.contracts();
    let active = view.active_contracts();

    row.flag("no_contract", contracts.is_empty());
    row.num("active_contract_count", Some(active.len() as f64), NullReason::NoContract);
    row.flag("multiple_active_contracts", active.len() > 1);

    if active.len() > 1 {
        let candidates: Vec<String> = active.iter().map(|c| c.contract_id.clone()).collect();
        log::warn!(
            "asof={asof} features: {} has {} active contracts, using {}",
            view.entity_id, active.len(), candidates[0]
        );
        row.note(RunEvent::ContractTieBreak {
            entity_id:      view.entity_id.to_string(),
            asof,
            chosen_contract: candidates[0].clone(),
            candidates,
        });
    }

    // Tenure from the earliest visible start.
    let tenure_days = contracts.iter().map(|c| c.start).min().map(|start| (asof - start).num_days() as f64);
    let tenure_months = tenure_days.map(|d| (d / DAYS_PER_MONTH).round());
    row.num("tenure_days", tenure_days, NullReason::NoContract);
    row.num("tenure_months", tenure_months, NullReason::NoContract);
    row.cat("tenure_bucket", tenure_months.map(|m| tenure_bucket(m).to_string()), NullReason::NoContract);

    // Renewal: earliest end among active contracts; with nothing active,
    // the latest end seen, which is in the past.
    let renewal_end = active.iter().filter_map(|c| c.end).min()
        .or_else(|| if active.is_empty() { contracts.iter().filter_map(|c| c.end).max() } else { None });
    let days_to_renewal = renewal_end.map(|end| (end - asof).num_days());
    let months_to_renewal = days_to_renewal.map(|d| round_to(d as f64 / DAYS_PER_MONTH, 1));
    let no_renewal = if contracts.is_empty() { NullReason::NoContract } else { NullReason::OpenEnded };
    row.num("days_to_renewal", days_to_renewal.map(|d| d as f64), no_renewal);
    row.num("months_to_renewal", months_to_renewal, no_renewal);
    row.cat("renewal_bucket", months_to_renewal.map(|m| renewal_bucket(m).to_string()), no_renewal);
    row.flag("is_within_3m_of_renewal", days_to_renewal.is_some_and(|d| d <= cfg.renewal_soon_days));
    row.flag("is_expired_contract", days_to_renewal.is_some_and(|d| d <= 0));

    let primary = active.first().copied().or_else(|| contracts.iter().max_by_key(|c| c.start));
    row.num("contract_term_months", primary.map(|c| f64::from(c.term_months)), NullReason::NoContract);
    row.cat(
        "contract_term_bucket",
        primary.map(|c| term_bucket(c.term_months).to_string()),
        NullReason::NoContract,
    );

    // Dual fuel over the contracts in force; falls back to history when none are.
    let in_force: Vec<Fuel> = if active.is_empty() {
        contracts.iter().map(|c| c.fuel).collect()
    } else {
        active.iter().map(|c| c.fuel).collect()
    };
    let dual = in_force.contains(&Fuel::Electricity) && in_force.contains(&Fuel::Gas);
    row.flag("is_dual_fuel", dual);
    let portfolio = (!contracts.is_empty()).then(|| {
        let segment = view.profile().map(|p| normalize_label(&p.segment)).unwrap_or_else(|| "unknown".into());
        format!("{segment}_{}", if dual { "DualFuel" } else { "SingleFuel" })
    });
    row.cat("portfolio_type", portfolio, NullReason::NoContract);
}

fn compute_profile(view: &EntityView<'_>, row: &mut RowBuilder) {
    let profile = view.profile();
    row.flag("no_profile", profile.is_none());
    row.cat("segment", profile.map(|p| normalize_label(&p.segment)), NullReason::NoProfile);

    let channel = profile.and_then(|p| p.sales_channel.as_deref()).map(normalize_label);
    let is = |name: &str| channel.as_deref() == Some(name);
    row.flag("is_comparison_channel", is("comparison_website"));
    row.flag("is_own_website_channel", is("own_website"));
    row.flag("is_digital_channel", is("comparison_website") || is("own_website"));
    row.cat("sales_channel", channel.clone(), NullReason::NoProfile);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_edges() {
        assert_eq!(renewal_bucket(0.0), "expired");
        assert_eq!(renewal_bucket(-3.0), "expired");
        assert_eq!(renewal_bucket(0.9), "0-1m");
        assert_eq!(renewal_bucket(3.0), "1-3m");
        assert_eq!(renewal_bucket(12.1), "12m+");
        assert_eq!(tenure_bucket(6.0), "0-6m");
        assert_eq!(tenure_bucket(61.0), "5y+");
        assert_eq!(term_bucket(12), "short");
        assert_eq!(term_bucket(24), "standard");
        assert_eq!(term_bucket(36), "long");
    }
}
