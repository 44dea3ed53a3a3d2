use churn_core::{
    asof::AsOfSnapshot,
    config::PipelineConfig,
    event::RunEvent,
    features::{
        assembler::FeatureAssembler, registry::FeatureRegistry, FeatureValue, NullReason,
    },
    sources::{
        BillingRecord, ContractRecord, ContractStatus, CustomerProfile, Fuel, InteractionRecord,
        MeterReading, PricePoint, Sentiment, SourceSnapshot,
    },
    types::Date,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn date(y: i32, m: u32, d: u32) -> Date {
    Date::from_ymd_opt(y, m, d).unwrap()
}

fn asof() -> Date {
    date(2026, 2, 1)
}

fn profile(id: &str) -> CustomerProfile {
    CustomerProfile {
        customer_id:   id.into(),
        segment:       "Residential".into(),
        sales_channel: Some("Comparison Website".into()),
        region:        "north".into(),
    }
}

fn contract(id: &str, customer: &str, start: &str, end: Option<&str>, fuel: Fuel) -> ContractRecord {
    ContractRecord {
        contract_id: id.into(),
        customer_id: customer.into(),
        start_date:  start.into(),
        end_date:    end.map(String::from),
        status:      ContractStatus::Active,
        term_months: 24,
        fuel,
    }
}

fn reading(customer: &str, ts: &str, kwh: f64) -> MeterReading {
    MeterReading { customer_id: customer.into(), timestamp: ts.into(), kwh }
}

fn price(ts: &str, value: f64) -> PricePoint {
    PricePoint { region: "north".into(), timestamp: ts.into(), price: value }
}

fn interaction(customer: &str, ts: &str, kind: &str, sentiment: Option<Sentiment>, intent: Option<&str>) -> InteractionRecord {
    InteractionRecord {
        customer_id: customer.into(),
        timestamp:   ts.into(),
        channel:     "phone".into(),
        kind:        kind.into(),
        sentiment,
        intent:      intent.map(String::from),
    }
}

/// E1: one contract ending 2026-03-01, three days of readings up to and
/// including the as-of day, plus one reading, one interaction and one
/// billing month dated after it.
/// E2: two overlapping active contracts.
/// E3: profile only, with readings strictly after the as-of date.
fn fixture() -> SourceSnapshot {
    SourceSnapshot {
        customers: vec![profile("E1"), profile("E2"), profile("E3")],
        contracts: vec![
            contract("K1", "E1", "2024-03-01", Some("2026-03-01"), Fuel::Electricity),
            contract("K2a", "E2", "2023-01-01", Some("2026-06-30"), Fuel::Electricity),
            contract("K2b", "E2", "2025-05-01", Some("2027-05-01"), Fuel::Gas),
        ],
        consumption: vec![
            reading("E1", "2026-01-30T08:00:00", 1.5),
            reading("E1", "2026-01-30T20:00:00", 1.5),
            reading("E1", "2026-01-31T08:00:00", 1.5),
            reading("E1", "2026-01-31T20:00:00", 1.5),
            reading("E1", "2026-02-01T08:00:00", 1.5),
            reading("E1", "2026-02-01T23:00:00", 1.5),
            reading("E1", "2026-02-02T01:00:00", 1_000_000.0),
            reading("E1", "not-a-timestamp", 1.5),
            reading("E3", "2026-02-05T10:00:00", 2.0),
            reading("E3", "2026-02-06T10:00:00", 2.0),
        ],
        tariff_prices: vec![
            price("2026-01-30T00:00:00", 0.30),
            price("2026-01-31T00:00:00", 0.32),
            price("2026-02-03T00:00:00", 9.99),
        ],
        benchmark_prices: vec![
            price("2026-01-31T00:00:00", 0.28),
        ],
        billing: vec![
            BillingRecord { customer_id: "E1".into(), period: "2025-12".into(), revenue: 100.0, cost: 80.0 },
            BillingRecord { customer_id: "E1".into(), period: "2026-01".into(), revenue: 100.0, cost: 70.0 },
            BillingRecord { customer_id: "E1".into(), period: "2026-02".into(), revenue: 100.0, cost: 500.0 },
        ],
        interactions: vec![
            interaction("E1", "2026-01-15T10:00:00", "complaint", Some(Sentiment::Negative), Some("Pricing Offers")),
            interaction("E1", "2026-02-10T10:00:00", "query", Some(Sentiment::Negative), Some("cancel_contract")),
        ],
    }
}

fn universe() -> Vec<String> {
    vec!["E1".into(), "E2".into(), "E3".into(), "GHOST".into()]
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Records dated after the as-of date never reach any feature.
#[test]
fn future_records_never_reach_features() {
    let cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    let snapshot = AsOfSnapshot::build(&fixture(), asof());
    snapshot.verify_point_in_time().expect("snapshot must pass its own point-in-time check");

    let row = FeatureAssembler::new(&registry, &cfg.features)
        .assemble_one(&snapshot, "E1")
        .unwrap()
        .row;

    assert_eq!(row.numeric("consumption_mean_90d"), Some(3.0),
        "daily mean must only see the three visible days, got {:?}", row.get("consumption_mean_90d"));
    assert_eq!(row.flag("has_cancel_intent_90d"), Some(false),
        "cancel intent recorded after asof leaked into the row");
    assert_eq!(row.numeric("interaction_count_365d"), Some(1.0));
    assert_eq!(row.category("last_intent"), Some("pricing_offers"));
    assert_eq!(row.numeric("latest_tariff_price"), Some(0.32),
        "tariff dated after asof leaked into latest price");
    assert_eq!(row.numeric("avg_monthly_margin"), Some(25.0),
        "billing month closing after asof must not count");
}

/// The as-of day itself is inside every window, late evening included.
#[test]
fn asof_boundary_is_inclusive() {
    let snapshot = AsOfSnapshot::build(&fixture(), asof());
    let consumption = snapshot.reports().iter().find(|r| r.source == "consumption").unwrap();
    assert_eq!(consumption.visible, 6, "E1's six readings through 2026-02-01T23:00, none of E3's");
    assert_eq!(consumption.future, 3);
    assert_eq!(consumption.malformed, 1);

    let view = snapshot.entity("E1");
    let last = view.consumption().last().unwrap();
    assert_eq!(last.ts.to_string(), "2026-02-01 23:00:00");
}

/// Contract ending 2026-03-01 seen from 2026-02-01 renews in 28 days.
#[test]
fn days_to_renewal_counts_from_asof() {
    let cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    let snapshot = AsOfSnapshot::build(&fixture(), asof());
    let row = FeatureAssembler::new(&registry, &cfg.features)
        .assemble_one(&snapshot, "E1")
        .unwrap()
        .row;

    assert_eq!(row.numeric("days_to_renewal"), Some(28.0));
    assert_eq!(row.category("renewal_bucket"), Some("0-1m"));
    assert_eq!(row.flag("is_within_3m_of_renewal"), Some(true));
    assert_eq!(row.flag("renewal_x_complaint"), Some(true));
    assert_eq!(row.flag("is_price_sensitive"), Some(true));
    assert_eq!(row.category("portfolio_type"), Some("residential_SingleFuel"));
}

/// Only post-asof consumption means no history: null with a flag, not zero.
#[test]
fn consumption_only_after_asof_is_no_history() {
    let cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    let snapshot = AsOfSnapshot::build(&fixture(), asof());
    let row = FeatureAssembler::new(&registry, &cfg.features)
        .assemble_one(&snapshot, "E3")
        .unwrap()
        .row;

    assert_eq!(row.flag("no_history"), Some(true));
    for name in ["consumption_mean_90d", "consumption_std_180d", "consumption_trend_90d"] {
        assert_eq!(row.get(name), Some(&FeatureValue::Null(NullReason::NoHistory)),
            "{name} must be null(no_history)");
    }
    assert_eq!(row.flag("no_contract"), Some(true));
    assert_eq!(row.get("days_to_renewal"), Some(&FeatureValue::Null(NullReason::NoContract)));
}

/// A contract without an end date still exists: renewal is null because it
/// is open-ended, and the entity is not flagged as contractless.
#[test]
fn open_ended_contract_is_not_reported_as_missing() {
    let cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    let sources = SourceSnapshot {
        customers: vec![profile("E4")],
        contracts: vec![contract("K4", "E4", "2025-01-01", None, Fuel::Gas)],
        ..Default::default()
    };
    let snapshot = AsOfSnapshot::build(&sources, asof());
    let row = FeatureAssembler::new(&registry, &cfg.features)
        .assemble_one(&snapshot, "E4")
        .unwrap()
        .row;

    assert_eq!(row.flag("no_contract"), Some(false));
    assert_eq!(row.numeric("active_contract_count"), Some(1.0));
    assert_eq!(row.get("days_to_renewal"), Some(&FeatureValue::Null(NullReason::OpenEnded)));
    assert_eq!(row.get("renewal_bucket"), Some(&FeatureValue::Null(NullReason::OpenEnded)));
    assert_eq!(row.flag("is_within_3m_of_renewal"), Some(false));
}

/// Every entity gets exactly one complete row, including one that appears
/// in no source at all.
#[test]
fn every_entity_gets_exactly_one_complete_row() {
    let cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    let snapshot = AsOfSnapshot::build(&fixture(), asof());
    let assembled = FeatureAssembler::new(&registry, &cfg.features)
        .assemble_batch(&snapshot, &universe(), 1)
        .unwrap();

    let ids: Vec<&str> = assembled.iter().map(|a| a.row.entity_id()).collect();
    assert_eq!(ids, vec!["E1", "E2", "E3", "GHOST"]);
    for a in &assembled {
        assert_eq!(a.row.values().len(), registry.len(),
            "{} has {} values, registry declares {}", a.row.entity_id(), a.row.values().len(), registry.len());
        assert_eq!(a.row.schema_version(), "fs-test-1");
        assert_eq!(a.row.asof_date(), asof());
    }

    let ghost = &assembled[3];
    assert!(!ghost.covered);
    assert_eq!(ghost.row.flag("no_coverage"), Some(true));
    assert_eq!(ghost.row.flag("no_profile"), Some(true));
    assert!(ghost.events.iter().any(|e| matches!(e, RunEvent::CoverageDefault { .. })));
}

/// Two active contracts resolve to the latest start and leave a trace.
#[test]
fn overlapping_active_contracts_are_tie_broken() {
    let cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    let snapshot = AsOfSnapshot::build(&fixture(), asof());
    let assembled = FeatureAssembler::new(&registry, &cfg.features)
        .assemble_one(&snapshot, "E2")
        .unwrap();

    let chosen = assembled.events.iter().find_map(|e| match e {
        RunEvent::ContractTieBreak { chosen_contract, candidates, .. } => Some((chosen_contract.clone(), candidates.len())),
        _ => None,
    });
    assert_eq!(chosen, Some(("K2b".to_string(), 2)));
    assert_eq!(assembled.row.flag("multiple_active_contracts"), Some(true));
    assert_eq!(assembled.row.flag("is_dual_fuel"), Some(true));
    // Earliest end among the active contracts.
    assert_eq!(assembled.row.numeric("days_to_renewal"), Some(149.0));
}

/// Same sources, same date, same schema: identical bytes, whatever the
/// worker count.
#[test]
fn assembly_is_idempotent_across_worker_counts() {
    let cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    let assembler = FeatureAssembler::new(&registry, &cfg.features);

    let render = |workers: usize| -> Vec<String> {
        let snapshot = AsOfSnapshot::build(&fixture(), asof());
        assembler.assemble_batch(&snapshot, &universe(), workers).unwrap()
            .iter()
            .map(|a| format!("{}|{}", a.row.entity_id(), a.row.canonical_values_json().unwrap()))
            .collect()
    };
    let serial = render(1);
    assert_eq!(serial, render(1));
    assert_eq!(serial, render(3));
}

/// Removing a base feature from the schema makes dependent compounds
/// unavailable instead of guessing.
#[test]
fn disabled_inputs_make_compounds_unavailable() {
    let mut cfg = PipelineConfig::default_test();
    cfg.features.schema_version = "fs-test-2".into();
    cfg.features.disabled = vec!["complaint_count_90d".into()];
    let registry = FeatureRegistry::standard(&cfg.features);
    assert!(!registry.contains("complaint_count_90d"));

    let snapshot = AsOfSnapshot::build(&fixture(), asof());
    let row = FeatureAssembler::new(&registry, &cfg.features)
        .assemble_one(&snapshot, "E1")
        .unwrap()
        .row;
    assert!(row.get("complaint_count_90d").is_none());
    assert_eq!(row.get("renewal_x_complaint"), Some(&FeatureValue::Null(NullReason::Unavailable)));
}
