//! Seeded synthetic sources for demos and end-to-end tests.
//!
//! Every table draws from its own `RngBank` stream, so the same
//! `SynthConfig` always yields byte-identical sources and labels.

use crate::{
    label::LabelRow,
    rng::{RngBank, StreamSlot},
    sources::{
        BillingRecord, ContractRecord, ContractStatus, CustomerProfile, Fuel, InteractionRecord,
        MeterReading, PricePoint, Sentiment, SourceSnapshot,
    },
    types::{Date, EntityId},
};
use chrono::{Datelike, Duration, Months};
use std::collections::BTreeMap;

const REGIONS: [&str; 4] = ["north", "south", "east", "west"];
const SEGMENTS: [&str; 3] = ["Residential", "SME", "Corporate"];
const SALES_CHANNELS: [&str; 4] = ["Comparison Website", "Own Website", "Direct Sales", "Telesales"];
const CONTACT_CHANNELS: [&str; 3] = ["phone", "email", "chat"];
const INTENTS: [&str; 4] = ["pricing_offers", "cancel_contract", "billing", "general"];
const TERMS: [u32; 3] = [12, 24, 36];

#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub customers:     usize,
    pub seed:          u64,
    /// Last day any source record may carry.
    pub history_end:   Date,
    /// Days of metered history before `history_end`.
    pub history_days:  i64,
}

impl SynthConfig {
    pub fn new(customers: usize, seed: u64, history_end: Date) -> Self {
        Self { customers, seed, history_end, history_days: 400 }
    }
}

#[derive(Debug, Clone)]
pub struct Synthetic {
    pub sources:    SourceSnapshot,
    /// Hidden per-customer churn propensity in [0, 1].
    pub propensity: BTreeMap<EntityId, f64>,
    seed:           u64,
}

pub fn customer_id(i: usize) -> EntityId {
    format!("C{i:05}")
}

fn day_str(d: Date) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn generate(cfg: &SynthConfig) -> Synthetic {
    let bank = RngBank::new(cfg.seed);
    let mut profiles_rng = bank.for_stream(StreamSlot::Profiles);
    let mut contracts_rng = bank.for_stream(StreamSlot::Contracts);
    let mut consumption_rng = bank.for_stream(StreamSlot::Consumption);
    let mut prices_rng = bank.for_stream(StreamSlot::Prices);
    let mut billing_rng = bank.for_stream(StreamSlot::Billing);
    let mut interactions_rng = bank.for_stream(StreamSlot::Interactions);

    let end = cfg.history_end;
    let start = end - Duration::days(cfg.history_days.max(1) - 1);
    let mut sources = SourceSnapshot::default();
    let mut propensity = BTreeMap::new();

    // ── Prices: one tariff and one benchmark series per region ──
    for region in REGIONS {
        let mut tariff = prices_rng.uniform(0.24, 0.34);
        let mut day = start;
        while day <= end {
            if day.day() == 1 && prices_rng.chance(0.35) {
                tariff = (tariff + prices_rng.normal(0.0, 0.015)).max(0.05);
            }
            let benchmark = (tariff + prices_rng.normal(-0.01, 0.02)).max(0.05);
            let ts = format!("{}T00:00:00", day_str(day));
            sources.tariff_prices.push(PricePoint { region: region.into(), timestamp: ts.clone(), price: tariff });
            sources.benchmark_prices.push(PricePoint { region: region.into(), timestamp: ts, price: benchmark });
            day += Duration::days(1);
        }
    }

    for i in 0..cfg.customers {
        let id = customer_id(i);
        let region = *profiles_rng.pick(&REGIONS).unwrap_or(&"north");
        let segment = *profiles_rng.pick(&SEGMENTS).unwrap_or(&"Residential");
        let sales_channel = if profiles_rng.chance(0.1) {
            None
        } else {
            profiles_rng.pick(&SALES_CHANNELS).map(|c| c.to_string())
        };
        let p = profiles_rng.next_f64();
        propensity.insert(id.clone(), p);

        // A small share of customers has no profile row at all.
        if !profiles_rng.chance(0.03) {
            sources.customers.push(CustomerProfile {
                customer_id: id.clone(),
                segment: segment.into(),
                sales_channel,
                region: region.into(),
            });
        }

        // ── Contracts ──
        if !contracts_rng.chance(0.04) {
            let term = *contracts_rng.pick(&TERMS).unwrap_or(&12);
            let contract_start = end - Duration::days(30 + contracts_rng.next_u64_below(1400) as i64);
            let contract_end = contract_start.checked_add_months(Months::new(term));
            let fuels: &[Fuel] = if contracts_rng.chance(0.45) { &[Fuel::Electricity, Fuel::Gas] } else { &[Fuel::Electricity] };
            for (n, fuel) in fuels.iter().enumerate() {
                sources.contracts.push(ContractRecord {
                    contract_id: format!("{id}-K{n}"),
                    customer_id: id.clone(),
                    start_date:  day_str(contract_start),
                    end_date:    contract_end.map(day_str),
                    status:      ContractStatus::Active,
                    term_months: term,
                    fuel:        *fuel,
                });
            }
        }

        // ── Consumption: four readings a day ──
        let base = consumption_rng.uniform(0.2, 2.5);
        let drift = consumption_rng.normal(0.0, 0.001);
        let mut day = start;
        let mut k = 0.0;
        while day <= end {
            for hour in [0u32, 6, 12, 18] {
                let mut kwh = (base * (1.0 + drift * k) + consumption_rng.normal(0.0, 0.15)).max(0.0);
                if consumption_rng.chance(0.001) {
                    kwh = -kwh - 0.1;
                }
                sources.consumption.push(MeterReading {
                    customer_id: id.clone(),
                    timestamp:   format!("{}T{hour:02}:00:00", day_str(day)),
                    kwh,
                });
            }
            k += 1.0;
            day += Duration::days(1);
        }

        // ── Billing: closed months ──
        let mut month = Date::from_ymd_opt(start.year(), start.month(), 1).unwrap_or(start);
        while month <= end {
            if let Some(month_end) = crate::sources::last_day_of_month(month) {
                if month_end > end {
                    break;
                }
            }
            let revenue = billing_rng.uniform(40.0, 160.0);
            let cost = revenue * billing_rng.uniform(0.75, 1.08);
            sources.billing.push(BillingRecord {
                customer_id: id.clone(),
                period: month.format("%Y-%m").to_string(),
                revenue,
                cost,
            });
            month = month.checked_add_months(Months::new(1)).unwrap_or(end + Duration::days(1));
        }

        // ── Interactions: rate grows with propensity ──
        let count = interactions_rng.next_u64_below(2 + (p * 12.0) as u64);
        for _ in 0..count {
            let day = start + Duration::days(interactions_rng.next_u64_below(cfg.history_days.max(1) as u64) as i64);
            let complaint = interactions_rng.chance(0.1 + 0.4 * p);
            let kind = if complaint { "complaint" } else { "query" };
            let sentiment = if interactions_rng.chance(0.2) {
                None
            } else if interactions_rng.chance(0.2 + 0.5 * p) {
                Some(Sentiment::Negative)
            } else if interactions_rng.chance(0.5) {
                Some(Sentiment::Neutral)
            } else {
                Some(Sentiment::Positive)
            };
            let intent = if interactions_rng.chance(0.3) {
                None
            } else if interactions_rng.chance(0.4 * p) {
                Some("cancel_contract".to_string())
            } else {
                interactions_rng.pick(&INTENTS).map(|s| s.to_string())
            };
            sources.interactions.push(InteractionRecord {
                customer_id: id.clone(),
                timestamp:   format!("{}T{:02}:{:02}:00", day_str(day),
                    8 + interactions_rng.next_u64_below(10), interactions_rng.next_u64_below(60)),
                channel:     interactions_rng.pick(&CONTACT_CHANNELS).map(|s| s.to_string()).unwrap_or_default(),
                kind:        kind.into(),
                sentiment,
                intent,
            });
        }
    }

    log::debug!(
        "synth: seed={} customers={} readings={} interactions={}",
        cfg.seed, cfg.customers, sources.consumption.len(), sources.interactions.len()
    );
    Synthetic { sources, propensity, seed: cfg.seed }
}

impl Synthetic {
    /// One label per (customer, as-of date). Positives get an effective
    /// date inside the horizon.
    pub fn labels(&self, asof_dates: &[Date], horizon_days: u32) -> Vec<LabelRow> {
        let mut rng = RngBank::new(self.seed).for_stream(StreamSlot::Labels);
        let mut out = Vec::with_capacity(asof_dates.len() * self.propensity.len());
        for asof in asof_dates {
            for (id, p) in &self.propensity {
                let churned = rng.chance(0.05 + 0.6 * p);
                let effective_date = churned.then(|| {
                    *asof + Duration::days(1 + rng.next_u64_below(u64::from(horizon_days.max(1))) as i64)
                });
                out.push(LabelRow {
                    entity_id:       id.clone(),
                    label_asof_date: *asof,
                    horizon_days,
                    outcome:         i64::from(churned),
                    effective_date,
                });
            }
        }
        out
    }
}
