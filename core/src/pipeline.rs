//! Batch run orchestration.
//!
//! FEATURE RUN ORDER (fixed):
//!   1. register the feature schema (refuses a changed definition)
//!   2. write the `started` manifest row
//!   3. build the as-of snapshot once: every source read, filtered, counted
//!   4. assemble rows batch by batch, checking for cancellation in between
//!   5. commit rows and events together; the manifest flips last
//!
//! SCORING RUN ORDER (fixed):
//!   1. pin every row to the scorer's schema version (mismatch is fatal)
//!      and refuse a second row for the same entity
//!   2. write the `started` manifest row
//!   3. score, tier and evaluate policy batch by batch
//!   4. commit records and events together
//!
//! RULES:
//!   - Configuration and reference tables are read once and only borrowed.
//!   - Nothing reaches the store before the commit step.
//!   - A failed or cancelled run is marked `aborted` and leaves no output.

use crate::{
    asof::{AsOfSnapshot, SourceFilterReport},
    config::PipelineConfig,
    error::{ChurnError, ChurnResult},
    event::RunEvent,
    features::{
        assembler::{AssemblySummary, FeatureAssembler},
        registry::FeatureRegistry,
        FeatureRow,
    },
    label::{LabelJoiner, LabelRow, TrainingSet},
    policy::{self, Action, PolicyInput, RecommendationRecord},
    scoring::{check_schema, score_checked, ScoringFunction},
    sources::SourceSnapshot,
    store::{universe_key, ChurnStore, CommitOutcome, OutputKey, RunKind},
    tiering::RiskTier,
    types::{Date, EntityId, RunId},
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Cooperative cancellation, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct FeatureRunSummary {
    pub run_id:       RunId,
    pub key:          OutputKey,
    pub outcome:      CommitOutcome,
    pub sources:      Vec<SourceFilterReport>,
    pub assembly:     AssemblySummary,
}

#[derive(Debug, Clone)]
pub struct ScoringRunSummary {
    pub run_id:          RunId,
    pub key:             OutputKey,
    pub model_id:        String,
    pub outcome:         CommitOutcome,
    pub records:         Vec<RecommendationRecord>,
    pub rejected:        usize,
    pub overrides:       usize,
    pub default_reasons: usize,
    pub per_tier:        BTreeMap<RiskTier, usize>,
    pub per_action:      BTreeMap<Action, usize>,
}

/// Fresh run identifier.
pub fn new_run_id() -> RunId {
    format!("run-{}", uuid::Uuid::new_v4())
}

fn sorted_universe(universe: &[EntityId]) -> Vec<EntityId> {
    let mut ids = universe.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

/// Mark the run aborted and hand back the original error.
fn abort(store: &ChurnStore, run_id: &str, batches_done: usize, err: ChurnError) -> ChurnError {
    if let Err(e) = store.mark_run_aborted(run_id, batches_done) {
        log::warn!("run {run_id}: could not record abort: {e}");
    }
    err
}

// ── Feature runs ─────────────────────────────────────────────────────────────

pub fn run_features(
    store: &ChurnStore,
    cfg: &PipelineConfig,
    sources: &SourceSnapshot,
    universe: &[EntityId],
    asof: Date,
    run_id: &str,
    control: &RunControl,
) -> ChurnResult<FeatureRunSummary> {
    let ids = sorted_universe(universe);
    if ids.is_empty() {
        return Err(ChurnError::NoEligibleEntities {
            stage:   "features".into(),
            context: format!("empty entity universe for asof {asof}"),
        });
    }

    let registry = FeatureRegistry::standard(&cfg.features);
    store.register_feature_schema(&registry)?;

    let key = OutputKey {
        kind:           RunKind::Features,
        universe_key:   universe_key(&ids),
        period_date:    asof,
        schema_version: registry.schema_version().to_string(),
    };
    store.begin_run(run_id, &key)?;
    log::info!(
        "asof={asof} features: run {run_id} started ({} entities, schema={})",
        ids.len(), key.schema_version
    );

    let snapshot = AsOfSnapshot::build(sources, asof);
    if let Err(e) = snapshot.verify_point_in_time() {
        return Err(abort(store, run_id, 0, e));
    }

    let mut events = vec![RunEvent::RunStarted {
        run_id:         run_id.to_string(),
        kind:           RunKind::Features.as_str().into(),
        period_date:    asof,
        schema_version: key.schema_version.clone(),
    }];
    for r in snapshot.reports().iter().filter(|r| r.excluded() > 0) {
        events.push(RunEvent::RecordsExcluded {
            source:    r.source.clone(),
            malformed: r.malformed,
            future:    r.future,
            invalid:   r.invalid,
        });
    }

    let assembler = FeatureAssembler::new(&registry, &cfg.features);
    let mut summary = AssemblySummary::default();
    let mut rows: Vec<FeatureRow> = Vec::with_capacity(ids.len());
    for (batch_no, batch) in ids.chunks(cfg.run.batch_size.max(1)).enumerate() {
        if control.is_cancelled() {
            log::warn!("asof={asof} features: run {run_id} cancelled after {batch_no} batch(es)");
            return Err(abort(store, run_id, batch_no, ChurnError::RunAborted {
                run_id:       run_id.to_string(),
                batches_done: batch_no,
            }));
        }
        let assembled = match assembler.assemble_batch(&snapshot, batch, cfg.run.workers) {
            Ok(a) => a,
            Err(e) => return Err(abort(store, run_id, batch_no, e)),
        };
        for a in assembled {
            summary.record(&a);
            events.extend(a.events);
            rows.push(a.row);
        }
        log::debug!("asof={asof} features: batch {batch_no} done ({} rows so far)", rows.len());
    }

    let batches = ids.len().div_ceil(cfg.run.batch_size.max(1));
    let outcome = store
        .commit_feature_run(run_id, &key, &rows, &events)
        .map_err(|e| abort(store, run_id, batches, e))?;
    match &outcome {
        CommitOutcome::Completed { rows_written, rows_already_recorded } => log::info!(
            "asof={asof} features: run {run_id} completed rows={} written={rows_written} already_recorded={rows_already_recorded} \
             default_rows={} tie_breaks={} collisions={} negative_values={}",
            summary.rows, summary.default_rows, summary.tie_breaks,
            summary.aggregation.collisions, summary.aggregation.negative_values
        ),
        CommitOutcome::Duplicate { of_record_run_id } => log::info!(
            "asof={asof} features: run {run_id} superseded by {of_record_run_id}"
        ),
    }

    Ok(FeatureRunSummary {
        run_id:   run_id.to_string(),
        key,
        outcome,
        sources:  snapshot.reports().to_vec(),
        assembly: summary,
    })
}

// ── Training sets ────────────────────────────────────────────────────────────

/// Join every stored row of `schema_version` to `labels`.
pub fn build_training_set(
    store: &ChurnStore,
    cfg: &PipelineConfig,
    labels: &[LabelRow],
    schema_version: &str,
) -> ChurnResult<TrainingSet> {
    let rows = store.feature_rows_for_schema(schema_version)?;
    if rows.is_empty() {
        return Err(ChurnError::NoEligibleEntities {
            stage:   "training_set".into(),
            context: format!("no stored feature rows for schema {schema_version}"),
        });
    }
    LabelJoiner::new(&cfg.labels).build(&rows, labels)
}

// ── Scoring runs ─────────────────────────────────────────────────────────────

pub fn run_scoring(
    store: &ChurnStore,
    cfg: &PipelineConfig,
    scorer: &dyn ScoringFunction,
    rows: &[FeatureRow],
    run_date: Date,
    run_id: &str,
    control: &RunControl,
) -> ChurnResult<ScoringRunSummary> {
    if rows.is_empty() {
        return Err(ChurnError::NoEligibleEntities {
            stage:   "scoring".into(),
            context: format!("no feature rows to score for run date {run_date}"),
        });
    }
    for row in rows {
        check_schema(scorer, row)?;
    }

    let mut rows: Vec<&FeatureRow> = rows.iter().collect();
    rows.sort_by(|a, b| a.entity_id().cmp(b.entity_id()));
    // Records are keyed by (entity, run_date).
    if let Some(pair) = rows.windows(2).find(|w| w[0].entity_id() == w[1].entity_id()) {
        return Err(ChurnError::DuplicateScoringEntity {
            entity_id: pair[0].entity_id().to_string(),
            run_date,
        });
    }
    let ids: Vec<EntityId> = rows.iter().map(|r| r.entity_id().to_string()).collect();
    let key = OutputKey {
        kind:           RunKind::Scoring,
        universe_key:   universe_key(&ids),
        period_date:    run_date,
        schema_version: scorer.schema_version().to_string(),
    };
    store.begin_run(run_id, &key)?;
    log::info!(
        "run_date={run_date} scoring: run {run_id} started ({} rows, model={})",
        rows.len(), scorer.model_id()
    );

    let mut events = vec![RunEvent::RunStarted {
        run_id:         run_id.to_string(),
        kind:           RunKind::Scoring.as_str().into(),
        period_date:    run_date,
        schema_version: key.schema_version.clone(),
    }];
    let mut summary = ScoringRunSummary {
        run_id:          run_id.to_string(),
        key:             key.clone(),
        model_id:        scorer.model_id().to_string(),
        outcome:         CommitOutcome::Completed { rows_written: 0, rows_already_recorded: 0 },
        records:         Vec::with_capacity(rows.len()),
        rejected:        0,
        overrides:       0,
        default_reasons: 0,
        per_tier:        BTreeMap::new(),
        per_action:      BTreeMap::new(),
    };

    for (batch_no, batch) in rows.chunks(cfg.run.batch_size.max(1)).enumerate() {
        if control.is_cancelled() {
            log::warn!("run_date={run_date} scoring: run {run_id} cancelled after {batch_no} batch(es)");
            return Err(abort(store, run_id, batch_no, ChurnError::RunAborted {
                run_id:       run_id.to_string(),
                batches_done: batch_no,
            }));
        }
        for row in batch {
            if let Err(e) = score_row(cfg, scorer, row, run_date, &mut summary, &mut events) {
                return Err(abort(store, run_id, batch_no, e));
            }
        }
    }

    let batches = rows.len().div_ceil(cfg.run.batch_size.max(1));
    if summary.records.is_empty() {
        return Err(abort(store, run_id, batches, ChurnError::NoEligibleEntities {
            stage:   "scoring".into(),
            context: format!("all {} rows were rejected by the scoring function", rows.len()),
        }));
    }

    summary.outcome = store
        .commit_scoring_run(run_id, &key, &summary.records, scorer.model_id(), &events)
        .map_err(|e| abort(store, run_id, batches, e))?;
    log::info!(
        "run_date={run_date} scoring: run {run_id} records={} rejected={} overrides={} default_reasons={} outcome={:?}",
        summary.records.len(), summary.rejected, summary.overrides, summary.default_reasons, summary.outcome
    );
    Ok(summary)
}

/// Score one row and run it through the policy engine. A probability the
/// scorer should never have produced rejects the record, not the run.
fn score_row(
    cfg: &PipelineConfig,
    scorer: &dyn ScoringFunction,
    row: &FeatureRow,
    run_date: Date,
    summary: &mut ScoringRunSummary,
    events: &mut Vec<RunEvent>,
) -> ChurnResult<()> {
    let score = match score_checked(scorer, row, cfg.run.top_drivers) {
        Ok(s) => s,
        Err(ChurnError::InvalidProbability { entity_id, value }) => {
            log::warn!("run_date={run_date} scoring: rejected {entity_id}: probability {value}");
            events.push(RunEvent::ScoreRejected {
                entity_id,
                reason: format!("probability {value} outside [0, 1]"),
            });
            summary.rejected += 1;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let margin = row.numeric("avg_monthly_margin").unwrap_or(0.0);
    let decision = policy::evaluate(&cfg.policy, &cfg.tiers, &PolicyInput {
        entity_id:              row.entity_id(),
        run_date,
        risk_score:             score.probability,
        segment:                row.category("segment").unwrap_or("unknown"),
        expected_margin_impact: score.probability * margin,
        drivers:                &score.drivers,
    })?;

    if decision.margin_override {
        events.push(RunEvent::GuardrailOverride {
            entity_id:              row.entity_id().to_string(),
            tier:                   decision.tier,
            base_action:            decision.base_action,
            expected_margin_impact: decision.record.expected_margin_impact(),
        });
        summary.overrides += 1;
    }
    if decision.default_reason {
        events.push(RunEvent::DefaultReasonSynthesized {
            entity_id: row.entity_id().to_string(),
            tier:      decision.tier,
        });
        summary.default_reasons += 1;
    }
    *summary.per_tier.entry(decision.tier).or_default() += 1;
    *summary.per_action.entry(decision.record.action()).or_default() += 1;
    summary.records.push(decision.record);
    Ok(())
}
