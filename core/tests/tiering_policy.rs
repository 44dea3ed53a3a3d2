use churn_core::{
    error::ChurnError,
    policy::{
        evaluate, Action, PolicyInput, PolicyTables, RecommendationRecord, TimingWindow,
        REASON_MARGIN_GUARDRAIL, REASON_MARGIN_OVERRIDE, REASON_TIER_DEFAULT,
    },
    tiering::{RiskTier, TierBand, TierBoundaries},
    types::Date,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn run_date() -> Date {
    Date::from_ymd_opt(2026, 2, 1).unwrap()
}

fn input<'a>(score: f64, margin: f64, drivers: &'a [String]) -> PolicyInput<'a> {
    PolicyInput {
        entity_id:              "E1",
        run_date:               run_date(),
        risk_score:             score,
        segment:                "residential",
        expected_margin_impact: margin,
        drivers,
    }
}

fn decide(score: f64, margin: f64, drivers: &[String]) -> Result<churn_core::policy::PolicyDecision, ChurnError> {
    evaluate(&PolicyTables::default(), &TierBoundaries::default(), &input(score, margin, drivers))
}

fn codes(record: &RecommendationRecord) -> Vec<&str> {
    record.reason_codes().iter().map(String::as_str).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// 0.85 with a positive margin is a critical customer worth a large offer now.
#[test]
fn critical_score_gets_large_offer_immediately() {
    let drivers = vec!["days_to_renewal".to_string()];
    let d = decide(0.85, 12.0, &drivers).unwrap();
    assert_eq!(d.tier, RiskTier::Critical);
    assert_eq!(d.record.action(), Action::LargeOffer);
    assert_eq!(d.record.timing_window(), TimingWindow::Immediate);
    assert_eq!(codes(&d.record), vec!["critical_churn_risk", "driver_days_to_renewal"]);
    assert!(!d.margin_override);
}

/// The margin floor wins over any tier and the timing follows the final action.
#[test]
fn negative_margin_forces_no_offer() {
    let d = decide(0.85, -5.0, &[]).unwrap();
    assert_eq!(d.base_action, Action::LargeOffer);
    assert_eq!(d.record.action(), Action::NoOffer);
    assert_eq!(d.record.timing_window(), TimingWindow::Days60To90);
    assert!(d.margin_override);
    assert_eq!(codes(&d.record).last().copied(), Some(REASON_MARGIN_OVERRIDE));
    assert_eq!(d.record.expected_margin_impact(), -5.0);
}

#[test]
fn low_risk_without_drivers_gets_tier_default() {
    let d = decide(0.1, 3.0, &[]).unwrap();
    assert_eq!(d.record.action(), Action::NoOffer);
    assert!(d.default_reason);
    assert_eq!(codes(&d.record), vec![REASON_TIER_DEFAULT]);
}

/// Already no_offer: the guardrail code marks the margin without claiming an override.
#[test]
fn low_risk_with_negative_margin_is_a_guardrail_not_an_override() {
    let d = decide(0.1, -1.0, &[]).unwrap();
    assert!(!d.margin_override);
    assert_eq!(codes(&d.record), vec![REASON_TIER_DEFAULT, REASON_MARGIN_GUARDRAIL]);
}

#[test]
fn out_of_range_scores_are_rejected() {
    for score in [1.2, -0.01, f64::NAN, f64::INFINITY] {
        assert!(
            matches!(decide(score, 1.0, &[]), Err(ChurnError::InvalidRiskScore { .. })),
            "score {score} must be rejected"
        );
    }
}

#[test]
fn non_finite_margin_is_rejected() {
    assert!(matches!(decide(0.5, f64::NAN, &[]), Err(ChurnError::InvalidMarginImpact { .. })));
}

#[test]
fn band_edges_belong_to_the_upper_tier() {
    let expect = [
        (0.0, RiskTier::Low, Action::NoOffer),
        (0.4, RiskTier::Medium, Action::SmallOffer),
        (0.6, RiskTier::High, Action::MediumOffer),
        (0.8, RiskTier::Critical, Action::LargeOffer),
        (1.0, RiskTier::Critical, Action::LargeOffer),
    ];
    for (score, tier, action) in expect {
        let d = decide(score, 1.0, &[]).unwrap();
        assert_eq!((d.tier, d.record.action()), (tier, action), "score {score}");
    }
}

/// Every score on a fine grid, with either margin sign, yields a record
/// that honours the record contract.
#[test]
fn every_valid_input_yields_a_valid_record() {
    let drivers = vec!["complaint_count_90d".to_string(), "segment=SME".to_string()];
    for i in 0..=1000 {
        let score = f64::from(i) / 1000.0;
        for margin in [-10.0, 0.0, 10.0] {
            let d = decide(score, margin, &drivers).unwrap();
            let r = &d.record;
            assert!(!r.reason_codes().is_empty());
            if margin < 0.0 {
                assert_eq!(r.action(), Action::NoOffer, "score {score} margin {margin}");
            }
            let expected_window = PolicyTables::default().action_windows[&r.action()];
            assert_eq!(r.timing_window(), expected_window);
        }
    }
}

#[test]
fn driver_codes_are_capped_and_deduplicated() {
    let drivers: Vec<String> = ["a", "b", "a", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
    let d = decide(0.65, 1.0, &drivers).unwrap();
    assert_eq!(codes(&d.record), vec!["high_churn_risk", "driver_a", "driver_b", "driver_c"]);
}

#[test]
fn gapped_or_misordered_tiers_are_rejected() {
    assert!(TierBoundaries::from_thresholds(0.4, 0.6, 0.8).is_ok());
    assert!(matches!(TierBoundaries::from_thresholds(0.6, 0.4, 0.8), Err(ChurnError::Config(_))));

    let gapped = vec![
        TierBand { tier: RiskTier::Low, lower: 0.0, upper: 0.4 },
        TierBand { tier: RiskTier::Medium, lower: 0.45, upper: 0.6 },
        TierBand { tier: RiskTier::High, lower: 0.6, upper: 0.8 },
        TierBand { tier: RiskTier::Critical, lower: 0.8, upper: 1.0 },
    ];
    assert!(matches!(TierBoundaries::new(gapped), Err(ChurnError::Config(_))));

    let short = vec![
        TierBand { tier: RiskTier::Low, lower: 0.0, upper: 0.5 },
        TierBand { tier: RiskTier::Medium, lower: 0.5, upper: 0.7 },
        TierBand { tier: RiskTier::High, lower: 0.7, upper: 0.8 },
        TierBand { tier: RiskTier::Critical, lower: 0.8, upper: 0.95 },
    ];
    assert!(matches!(TierBoundaries::new(short), Err(ChurnError::Config(_))));
}

#[test]
fn custom_tiers_move_the_decision() {
    let tiers = TierBoundaries::from_thresholds(0.2, 0.5, 0.9).unwrap();
    let d = evaluate(&PolicyTables::default(), &tiers, &input(0.85, 1.0, &[])).unwrap();
    assert_eq!(d.tier, RiskTier::High);
    assert_eq!(d.record.action(), Action::MediumOffer);
}

#[test]
fn record_constructor_enforces_its_contract() {
    let make = |score: f64, action: Action, margin: f64, codes: Vec<String>| {
        RecommendationRecord::new(
            "E1".into(), run_date(), score, "sme".into(), action,
            TimingWindow::Immediate, margin, codes,
        )
    };
    let ok = vec!["high_churn_risk".to_string()];
    assert!(make(0.7, Action::MediumOffer, 1.0, ok.clone()).is_ok());
    assert!(matches!(make(0.7, Action::MediumOffer, 1.0, vec![]), Err(ChurnError::InvalidRecommendation { .. })));
    assert!(matches!(make(0.7, Action::MediumOffer, 1.0, vec![" ".into()]), Err(ChurnError::InvalidRecommendation { .. })));
    assert!(matches!(make(0.7, Action::MediumOffer, -1.0, ok.clone()), Err(ChurnError::InvalidRecommendation { .. })));
    assert!(matches!(make(1.5, Action::NoOffer, 1.0, ok), Err(ChurnError::InvalidRiskScore { .. })));
}
