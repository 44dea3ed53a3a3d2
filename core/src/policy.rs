//! Retention policy engine.
//!
//! A pure function from (score, segment, expected margin impact, driver
//! signals) to one `RecommendationRecord`. Steps, in this order:
//!   1. validate the score (outside [0, 1] is fatal for the record)
//!   2. tier lookup and base action from the tier→action table
//!   3. reason codes: tier code, then driver codes; `tier_default` if none
//!   4. margin floor: a negative expected margin forces `no_offer` and
//!      appends the override code. Always the last decision step.
//!   5. timing window from the final action
//!
//! Nothing outside `PolicyInput` and the tables is consulted. `run_date`
//! only stamps the record.

use crate::{
    error::{ChurnError, ChurnResult},
    tiering::{RiskTier, TierBoundaries},
    types::{Date, EntityId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REASON_TIER_DEFAULT: &str = "tier_default";
pub const REASON_MARGIN_OVERRIDE: &str = "negative_margin_override";
pub const REASON_MARGIN_GUARDRAIL: &str = "negative_margin_guardrail";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOffer,
    SmallOffer,
    MediumOffer,
    LargeOffer,
}

impl Action {
    pub const ALL: [Action; 4] = [Self::NoOffer, Self::SmallOffer, Self::MediumOffer, Self::LargeOffer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOffer     => "no_offer",
            Self::SmallOffer  => "small_offer",
            Self::MediumOffer => "medium_offer",
            Self::LargeOffer  => "large_offer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimingWindow {
    #[serde(rename = "immediate")]
    Immediate,
    #[serde(rename = "30_60_days")]
    Days30To60,
    #[serde(rename = "60_90_days")]
    Days60To90,
    #[serde(rename = "90_plus_days")]
    Days90Plus,
}

impl TimingWindow {
    pub const ALL: [TimingWindow; 4] = [Self::Immediate, Self::Days30To60, Self::Days60To90, Self::Days90Plus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate  => "immediate",
            Self::Days30To60 => "30_60_days",
            Self::Days60To90 => "60_90_days",
            Self::Days90Plus => "90_plus_days",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.as_str() == s)
    }
}

/// Lookup tables behind the policy, from `policy/retention_policy.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTables {
    pub tier_actions:       BTreeMap<RiskTier, Action>,
    pub action_windows:     BTreeMap<Action, TimingWindow>,
    /// Upper bound on `driver_*` codes per record.
    #[serde(default = "default_max_driver_reasons")]
    pub max_driver_reasons: usize,
}

fn default_max_driver_reasons() -> usize {
    3
}

impl Default for PolicyTables {
    fn default() -> Self {
        Self {
            tier_actions: BTreeMap::from([
                (RiskTier::Low,      Action::NoOffer),
                (RiskTier::Medium,   Action::SmallOffer),
                (RiskTier::High,     Action::MediumOffer),
                (RiskTier::Critical, Action::LargeOffer),
            ]),
            action_windows: BTreeMap::from([
                (Action::NoOffer,     TimingWindow::Days60To90),
                (Action::SmallOffer,  TimingWindow::Days30To60),
                (Action::MediumOffer, TimingWindow::Immediate),
                (Action::LargeOffer,  TimingWindow::Immediate),
            ]),
            max_driver_reasons: default_max_driver_reasons(),
        }
    }
}

impl PolicyTables {
    /// Every tier maps to an action and every action to a window.
    pub fn validate(&self) -> ChurnResult<()> {
        for tier in RiskTier::ALL {
            if !self.tier_actions.contains_key(&tier) {
                return Err(ChurnError::Config(format!("retention policy: no action for tier '{}'", tier.as_str())));
            }
        }
        for action in Action::ALL {
            if !self.action_windows.contains_key(&action) {
                return Err(ChurnError::Config(format!("retention policy: no timing window for action '{}'", action.as_str())));
            }
        }
        Ok(())
    }

    fn action_for(&self, tier: RiskTier) -> ChurnResult<Action> {
        self.tier_actions.get(&tier).copied()
            .ok_or_else(|| ChurnError::Config(format!("retention policy: no action for tier '{}'", tier.as_str())))
    }

    fn window_for(&self, action: Action) -> ChurnResult<TimingWindow> {
        self.action_windows.get(&action).copied()
            .ok_or_else(|| ChurnError::Config(format!("retention policy: no timing window for action '{}'", action.as_str())))
    }
}

/// One persisted recommendation. Fields are private: the only way in is
/// `new`, which enforces the record contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationRecord {
    entity_id:              EntityId,
    run_date:               Date,
    risk_score:             f64,
    segment:                String,
    action:                 Action,
    timing_window:          TimingWindow,
    expected_margin_impact: f64,
    reason_codes:           Vec<String>,
}

impl RecommendationRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_id: EntityId,
        run_date: Date,
        risk_score: f64,
        segment: String,
        action: Action,
        timing_window: TimingWindow,
        expected_margin_impact: f64,
        reason_codes: Vec<String>,
    ) -> ChurnResult<Self> {
        let invalid = |reason: &str| ChurnError::InvalidRecommendation {
            entity_id: entity_id.clone(),
            reason:    reason.into(),
        };
        if !risk_score.is_finite() || !(0.0..=1.0).contains(&risk_score) {
            return Err(ChurnError::InvalidRiskScore { entity_id, score: risk_score });
        }
        if !expected_margin_impact.is_finite() {
            return Err(ChurnError::InvalidMarginImpact { entity_id, value: expected_margin_impact });
        }
        if reason_codes.is_empty() || reason_codes.iter().any(|c| c.trim().is_empty()) {
            return Err(invalid("reason_codes must be non-empty"));
        }
        if expected_margin_impact < 0.0 && action != Action::NoOffer {
            return Err(invalid("negative expected margin impact requires no_offer"));
        }
        Ok(Self {
            entity_id,
            run_date,
            risk_score,
            segment,
            action,
            timing_window,
            expected_margin_impact,
            reason_codes,
        })
    }

    pub fn entity_id(&self) -> &str { &self.entity_id }
    pub fn run_date(&self) -> Date { self.run_date }
    pub fn risk_score(&self) -> f64 { self.risk_score }
    pub fn segment(&self) -> &str { &self.segment }
    pub fn action(&self) -> Action { self.action }
    pub fn timing_window(&self) -> TimingWindow { self.timing_window }
    pub fn expected_margin_impact(&self) -> f64 { self.expected_margin_impact }
    pub fn reason_codes(&self) -> &[String] { &self.reason_codes }
}

#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub entity_id:              &'a str,
    pub run_date:               Date,
    pub risk_score:             f64,
    pub segment:                &'a str,
    pub expected_margin_impact: f64,
    /// Ranked driver feature names from the scoring function.
    pub drivers:                &'a [String],
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub record:          RecommendationRecord,
    pub tier:            RiskTier,
    pub base_action:     Action,
    /// The margin floor changed the action.
    pub margin_override: bool,
    /// `tier_default` was synthesized.
    pub default_reason:  bool,
}

pub fn evaluate(
    tables: &PolicyTables,
    tiers: &TierBoundaries,
    input: &PolicyInput<'_>,
) -> ChurnResult<PolicyDecision> {
    let tier = tiers.assign(input.risk_score).ok_or_else(|| ChurnError::InvalidRiskScore {
        entity_id: input.entity_id.to_string(),
        score:     input.risk_score,
    })?;
    if !input.expected_margin_impact.is_finite() {
        return Err(ChurnError::InvalidMarginImpact {
            entity_id: input.entity_id.to_string(),
            value:     input.expected_margin_impact,
        });
    }

    let base_action = tables.action_for(tier)?;

    let mut reason_codes: Vec<String> = Vec::new();
    if let Some(code) = tier.reason_code() {
        reason_codes.push(code.to_string());
    }
    for code in input.drivers.iter()
        .map(|d| driver_code(d))
        .filter(|c| c != "driver_")
    {
        if reason_codes.iter().filter(|c| c.starts_with("driver_")).count() >= tables.max_driver_reasons {
            break;
        }
        if !reason_codes.contains(&code) {
            reason_codes.push(code);
        }
    }
    let default_reason = reason_codes.is_empty();
    if default_reason {
        reason_codes.push(REASON_TIER_DEFAULT.to_string());
    }

    let mut action = base_action;
    let mut margin_override = false;
    if input.expected_margin_impact < 0.0 {
        action = Action::NoOffer;
        margin_override = base_action != Action::NoOffer;
        reason_codes.push(
            if margin_override { REASON_MARGIN_OVERRIDE } else { REASON_MARGIN_GUARDRAIL }.to_string(),
        );
    }

    let timing = tables.window_for(action)?;

    let record = RecommendationRecord::new(
        input.entity_id.to_string(),
        input.run_date,
        input.risk_score,
        input.segment.to_string(),
        action,
        timing,
        input.expected_margin_impact,
        reason_codes,
    )?;

    Ok(PolicyDecision { record, tier, base_action, margin_override, default_reason })
}

/// `driver_<feature>`, lowercased, with anything outside [a-z0-9_]
/// folded to `_`.
pub fn driver_code(feature: &str) -> String {
    let slug: String = feature.trim().chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("driver_{slug}")
}
