//! Audit events — the explainability trail of a run.
//!
//! RULE: events are buffered with the run's output and committed in the
//! same transaction. A run that never completes leaves no events behind
//! except its own abort or supersession marker.

use crate::{
    policy::Action,
    tiering::RiskTier,
    types::{Date, EntityId, RunId, SchemaVersion},
};
use serde::{Deserialize, Serialize};

/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id:         RunId,
        kind:           String,
        period_date:    Date,
        schema_version: SchemaVersion,
    },
    RecordsExcluded {
        source:    String,
        malformed: usize,
        future:    usize,
        invalid:   usize,
    },
    ContractTieBreak {
        entity_id:       EntityId,
        asof:            Date,
        chosen_contract: String,
        candidates:      Vec<String>,
    },
    CoverageDefault {
        entity_id: EntityId,
    },
    ScoreRejected {
        entity_id: EntityId,
        reason:    String,
    },
    GuardrailOverride {
        entity_id:              EntityId,
        tier:                   RiskTier,
        base_action:            Action,
        expected_margin_impact: f64,
    },
    DefaultReasonSynthesized {
        entity_id: EntityId,
        tier:      RiskTier,
    },
    RunSuperseded {
        run_id:           RunId,
        of_record_run_id: RunId,
    },
    RunAborted {
        run_id:       RunId,
        batches_done: usize,
    },
    RunCompleted {
        run_id: RunId,
        rows:   usize,
    },
}

/// Persisted form of a `RunEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub seq:        usize,
    pub event_type: String,
    pub payload:    String, // JSON-serialized RunEvent
}

impl EventLogEntry {
    pub fn from_event(run_id: &str, seq: usize, event: &RunEvent) -> serde_json::Result<Self> {
        Ok(Self {
            id:         None,
            run_id:     run_id.to_string(),
            seq,
            event_type: event_type_name(event).to_string(),
            payload:    serde_json::to_string(event)?,
        })
    }

    pub fn event(&self) -> serde_json::Result<RunEvent> {
        serde_json::from_str(&self.payload)
    }
}

/// Stable name for the `event_type` column.
pub fn event_type_name(event: &RunEvent) -> &'static str {
    match event {
        RunEvent::RunStarted { .. }               => "run_started",
        RunEvent::RecordsExcluded { .. }          => "records_excluded",
        RunEvent::ContractTieBreak { .. }         => "contract_tie_break",
        RunEvent::CoverageDefault { .. }          => "coverage_default",
        RunEvent::ScoreRejected { .. }            => "score_rejected",
        RunEvent::GuardrailOverride { .. }        => "guardrail_override",
        RunEvent::DefaultReasonSynthesized { .. } => "default_reason_synthesized",
        RunEvent::RunSuperseded { .. }            => "run_superseded",
        RunEvent::RunAborted { .. }               => "run_aborted",
        RunEvent::RunCompleted { .. }             => "run_completed",
    }
}
