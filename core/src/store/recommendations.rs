use super::{date_from_sql, date_to_sql, ChurnStore, CommitOutcome, OutputKey};
use crate::{
    error::ChurnResult,
    event::RunEvent,
    policy::{Action, RecommendationRecord, TimingWindow},
    types::{Date, RunId},
};
use rusqlite::params;

/// A recommendation as read back, with the run that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecommendation {
    pub record:         RecommendationRecord,
    pub run_id:         RunId,
    pub model_id:       String,
    pub schema_version: String,
}

impl ChurnStore {
    pub fn commit_scoring_run(
        &self,
        run_id: &str,
        key: &OutputKey,
        records: &[RecommendationRecord],
        model_id: &str,
        events: &[RunEvent],
    ) -> ChurnResult<CommitOutcome> {
        self.commit_run(run_id, key, events, |conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO recommendation
                    (entity_id, run_date, run_id, risk_score, segment, action, timing_window,
                     expected_margin_impact, reason_codes, model_id, schema_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (entity_id, run_date) DO NOTHING",
            )?;
            let mut written = 0;
            let mut already = 0;
            for r in records {
                let n = stmt.execute(params![
                    r.entity_id(),
                    date_to_sql(r.run_date()),
                    run_id,
                    r.risk_score(),
                    r.segment(),
                    r.action().as_str(),
                    r.timing_window().as_str(),
                    r.expected_margin_impact(),
                    serde_json::to_string(r.reason_codes())?,
                    model_id,
                    key.schema_version,
                ])?;
                if n == 1 { written += 1 } else { already += 1 }
            }
            Ok((written, already))
        })
    }

    /// Recommendations for one run date, by entity. Each is re-validated
    /// through `RecommendationRecord::new` on the way out.
    pub fn recommendations_for_run_date(&self, run_date: Date) -> ChurnResult<Vec<StoredRecommendation>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, run_date, run_id, risk_score, segment, action, timing_window,
                    expected_margin_impact, reason_codes, model_id, schema_version
             FROM recommendation WHERE run_date = ?1 ORDER BY entity_id",
        )?;
        let raw = stmt.query_map(params![date_to_sql(run_date)], |row| {
            let run_date: String = row.get(1)?;
            let action: String = row.get(5)?;
            let timing: String = row.get(6)?;
            let bad_text = |idx: usize, what: String| rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                what.into(),
            );
            Ok(RawRecommendation {
                entity_id:              row.get(0)?,
                run_date:               date_from_sql(1, &run_date)?,
                run_id:                 row.get(2)?,
                risk_score:             row.get(3)?,
                segment:                row.get(4)?,
                action:                 Action::parse(&action)
                    .ok_or_else(|| bad_text(5, format!("unknown action {action}")))?,
                timing_window:          TimingWindow::parse(&timing)
                    .ok_or_else(|| bad_text(6, format!("unknown timing window {timing}")))?,
                expected_margin_impact: row.get(7)?,
                reason_codes:           row.get(8)?,
                model_id:               row.get(9)?,
                schema_version:         row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|r| {
                let reason_codes: Vec<String> = serde_json::from_str(&r.reason_codes)?;
                Ok(StoredRecommendation {
                    record: RecommendationRecord::new(
                        r.entity_id,
                        r.run_date,
                        r.risk_score,
                        r.segment,
                        r.action,
                        r.timing_window,
                        r.expected_margin_impact,
                        reason_codes,
                    )?,
                    run_id:         r.run_id,
                    model_id:       r.model_id,
                    schema_version: r.schema_version,
                })
            })
            .collect()
    }
}

struct RawRecommendation {
    entity_id:              String,
    run_date:               Date,
    run_id:                 String,
    risk_score:             f64,
    segment:                String,
    action:                 Action,
    timing_window:          TimingWindow,
    expected_margin_impact: f64,
    reason_codes:           String,
    model_id:               String,
    schema_version:         String,
}
