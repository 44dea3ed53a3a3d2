//! Risk tiering: probability → ordinal tier through validated half-open bands.
//!
//! Bands are configuration. A `TierBoundaries` value can only be built
//! through validation, so an instance in hand always covers [0, 1] exactly:
//! Low, Medium, High, Critical in that order, contiguous, first band
//! starting at 0 and the last band closed at 1.

use crate::error::{ChurnError, ChurnResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub const ALL: [RiskTier; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low      => "low",
            Self::Medium   => "medium",
            Self::High     => "high",
            Self::Critical => "critical",
        }
    }

    /// Reason code describing the tier itself. Low risk carries none.
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            Self::Low      => None,
            Self::Medium   => Some("moderate_churn_risk"),
            Self::High     => Some("high_churn_risk"),
            Self::Critical => Some("critical_churn_risk"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierBand {
    pub tier:  RiskTier,
    pub lower: f64,
    pub upper: f64,
}

/// On-disk shape of `policy/risk_tiers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBandsFile {
    pub bands: Vec<TierBand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TierBandsFile", into = "TierBandsFile")]
pub struct TierBoundaries {
    bands: Vec<TierBand>,
}

impl TryFrom<TierBandsFile> for TierBoundaries {
    type Error = ChurnError;

    fn try_from(file: TierBandsFile) -> ChurnResult<Self> {
        Self::new(file.bands)
    }
}

impl From<TierBoundaries> for TierBandsFile {
    fn from(b: TierBoundaries) -> Self {
        Self { bands: b.bands }
    }
}

impl TierBoundaries {
    pub fn new(bands: Vec<TierBand>) -> ChurnResult<Self> {
        let err = |msg: String| Err(ChurnError::Config(format!("risk tiers: {msg}")));

        if bands.len() != RiskTier::ALL.len() {
            return err(format!("expected {} bands, got {}", RiskTier::ALL.len(), bands.len()));
        }
        for (band, expected) in bands.iter().zip(RiskTier::ALL) {
            if band.tier != expected {
                return err(format!("band for '{}' found where '{}' belongs", band.tier.as_str(), expected.as_str()));
            }
            if !band.lower.is_finite() || !band.upper.is_finite() {
                return err(format!("band '{}' has a non-finite edge", band.tier.as_str()));
            }
            if band.lower >= band.upper {
                return err(format!(
                    "band '{}' is empty or inverted: [{}, {})",
                    band.tier.as_str(), band.lower, band.upper
                ));
            }
        }
        if bands[0].lower != 0.0 {
            return err(format!("first band must start at 0, starts at {}", bands[0].lower));
        }
        for pair in bands.windows(2) {
            if pair[0].upper != pair[1].lower {
                return err(format!(
                    "gap or overlap between '{}' (upper {}) and '{}' (lower {})",
                    pair[0].tier.as_str(), pair[0].upper, pair[1].tier.as_str(), pair[1].lower
                ));
            }
        }
        let last = bands[bands.len() - 1];
        if last.upper != 1.0 {
            return err(format!("last band must end at 1, ends at {}", last.upper));
        }
        Ok(Self { bands })
    }

    /// Bands from three increasing cut points.
    pub fn from_thresholds(medium: f64, high: f64, critical: f64) -> ChurnResult<Self> {
        let edges = [0.0, medium, high, critical, 1.0];
        Self::new(
            RiskTier::ALL.iter().enumerate()
                .map(|(i, tier)| TierBand { tier: *tier, lower: edges[i], upper: edges[i + 1] })
                .collect(),
        )
    }

    pub fn bands(&self) -> &[TierBand] {
        &self.bands
    }

    /// None when `score` is not a finite number in [0, 1].
    pub fn assign(&self, score: f64) -> Option<RiskTier> {
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return None;
        }
        let last = self.bands.len() - 1;
        self.bands.iter().enumerate()
            .find(|(i, b)| score >= b.lower && (score < b.upper || *i == last))
            .map(|(_, b)| b.tier)
    }
}

impl Default for TierBoundaries {
    fn default() -> Self {
        let edges = [0.0, 0.4, 0.6, 0.8, 1.0];
        Self {
            bands: RiskTier::ALL.iter().enumerate()
                .map(|(i, tier)| TierBand { tier: *tier, lower: edges[i], upper: edges[i + 1] })
                .collect(),
        }
    }
}
