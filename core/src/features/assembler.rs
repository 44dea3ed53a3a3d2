//! As-of feature assembler: one `FeatureRow` per entity in the universe.
//!
//! Per entity, in order:
//!   1. take the entity's view from the filtered snapshot
//!   2. check the view against the as-of date (a hit is a defect)
//!   3. run the base calculators (any order)
//!   4. barrier: every registered base feature is resolved or marked
//!      `Unavailable`
//!   5. compound features
//!
//! Entities with no data anywhere still get a row, flagged `no_coverage`.

use super::{
    behavioral, compound, lifecycle, market,
    registry::{FeatureCategory, FeatureRegistry},
    volatility, FeatureRow, FeatureValue, NullReason, RowBuilder,
};
use crate::{
    asof::AsOfSnapshot,
    config::FeatureConfig,
    error::ChurnResult,
    event::RunEvent,
    grain::AggregationReport,
    types::EntityId,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct AssembledRow {
    pub row:         FeatureRow,
    pub events:      Vec<RunEvent>,
    pub covered:     bool,
    pub aggregation: AggregationReport,
}

pub struct FeatureAssembler<'a> {
    registry: &'a FeatureRegistry,
    config:   &'a FeatureConfig,
}

impl<'a> FeatureAssembler<'a> {
    pub fn new(registry: &'a FeatureRegistry, config: &'a FeatureConfig) -> Self {
        Self { registry, config }
    }

    pub fn assemble_one(&self, snapshot: &AsOfSnapshot, entity_id: &str) -> ChurnResult<AssembledRow> {
        let view = snapshot.entity(entity_id);
        view.verify()?;

        let mut builder = RowBuilder::default();
        builder.flag("no_coverage", !view.covered);
        if !view.covered {
            builder.note(RunEvent::CoverageDefault { entity_id: entity_id.to_string() });
        }

        lifecycle::compute(&view, self.config, &mut builder);
        market::compute(&view, self.config, &mut builder);
        let aggregation = volatility::compute(&view, self.config, &mut builder);
        behavioral::compute(&view, self.config, &mut builder);

        let (mut computed, events) = builder.into_parts();

        // Barrier: keep exactly the registered base features.
        let mut base = RowBuilder::default();
        for def in self.registry.definitions().iter().filter(|d| d.category != FeatureCategory::Compound) {
            let value = computed.remove(&def.name).unwrap_or(FeatureValue::Null(NullReason::Unavailable));
            base.set(def.name.clone(), value);
        }
        compound::compute(self.registry, &mut base);

        let (values, _) = base.into_parts();
        Ok(AssembledRow {
            row: FeatureRow::new(
                entity_id.to_string(),
                snapshot.asof(),
                self.registry.schema_version().to_string(),
                values,
            ),
            events,
            covered: view.covered,
            aggregation,
        })
    }

    /// Assemble a batch with up to `workers` scoped threads. Output is in
    /// entity-id order whatever the worker count.
    pub fn assemble_batch(
        &self,
        snapshot: &AsOfSnapshot,
        entity_ids: &[EntityId],
        workers: usize,
    ) -> ChurnResult<Vec<AssembledRow>> {
        let mut rows: Vec<AssembledRow> = if workers <= 1 || entity_ids.len() < 2 {
            entity_ids.iter()
                .map(|id| self.assemble_one(snapshot, id))
                .collect::<ChurnResult<_>>()?
        } else {
            let chunk = entity_ids.len().div_ceil(workers);
            let results: Vec<ChurnResult<Vec<AssembledRow>>> = std::thread::scope(|scope| {
                let handles: Vec<_> = entity_ids.chunks(chunk)
                    .map(|ids| scope.spawn(move || {
                        ids.iter().map(|id| self.assemble_one(snapshot, id)).collect::<ChurnResult<Vec<_>>>()
                    }))
                    .collect();
                handles.into_iter()
                    .map(|h| h.join().unwrap_or_else(|_| {
                        Err(anyhow::anyhow!("feature worker panicked").into())
                    }))
                    .collect()
            });
            let mut rows = Vec::with_capacity(entity_ids.len());
            for part in results {
                rows.extend(part?);
            }
            rows
        };
        rows.sort_by(|a, b| a.row.entity_id().cmp(b.row.entity_id()));
        Ok(rows)
    }
}

/// Counts a feature run reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblySummary {
    pub rows:         usize,
    pub default_rows: usize,
    pub tie_breaks:   usize,
    pub aggregation:  AggregationReport,
    /// How many rows carry a null, per feature.
    pub null_counts:  BTreeMap<String, usize>,
}

impl AssemblySummary {
    pub fn record(&mut self, assembled: &AssembledRow) {
        self.rows += 1;
        if !assembled.covered {
            self.default_rows += 1;
        }
        self.tie_breaks += assembled.events.iter()
            .filter(|e| matches!(e, RunEvent::ContractTieBreak { .. }))
            .count();
        self.aggregation.absorb(&assembled.aggregation);
        for (name, value) in assembled.row.values() {
            if value.is_null() {
                *self.null_counts.entry(name.clone()).or_default() += 1;
            }
        }
    }
}
