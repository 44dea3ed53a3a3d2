use super::{date_from_sql, date_to_sql, now_stamp, ChurnStore, CommitOutcome, OutputKey};
use crate::{
    error::{ChurnError, ChurnResult},
    event::RunEvent,
    features::{registry::FeatureRegistry, FeatureRow, FeatureValue},
    types::Date,
};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::BTreeMap;

impl ChurnStore {
    // ── Feature schema ────────────────────────────────────────────

    /// Register the registry's definitions under its schema version.
    /// Returns false when the identical definition is already registered;
    /// a different definition under the same version is refused.
    pub fn register_feature_schema(&self, registry: &FeatureRegistry) -> ChurnResult<bool> {
        let definition = registry.canonical_definition_json()?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO feature_schema (schema_version, definition_json, feature_count, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![registry.schema_version(), definition, registry.len() as i64, now_stamp()],
        )?;
        if inserted == 1 {
            tx.commit()?;
            log::info!(
                "store: registered feature schema {} ({} features)",
                registry.schema_version(), registry.len()
            );
            return Ok(true);
        }
        let stored: String = tx.query_row(
            "SELECT definition_json FROM feature_schema WHERE schema_version = ?1",
            params![registry.schema_version()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        if stored == definition {
            Ok(false)
        } else {
            Err(ChurnError::SchemaDefinitionConflict {
                version: registry.schema_version().to_string(),
            })
        }
    }

    pub fn feature_schema_definition(&self, schema_version: &str) -> ChurnResult<Option<String>> {
        Ok(self.conn.query_row(
            "SELECT definition_json FROM feature_schema WHERE schema_version = ?1",
            params![schema_version],
            |row| row.get(0),
        ).optional()?)
    }

    // ── Feature rows ──────────────────────────────────────────────

    /// Commit a feature run. Rows already present under their
    /// (entity, asof, schema) key are left as they are.
    pub fn commit_feature_run(
        &self,
        run_id: &str,
        key: &OutputKey,
        rows: &[FeatureRow],
        events: &[RunEvent],
    ) -> ChurnResult<CommitOutcome> {
        self.commit_run(run_id, key, events, |conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO feature_row (entity_id, asof_date, schema_version, run_id, values_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (entity_id, asof_date, schema_version) DO NOTHING",
            )?;
            let mut written = 0;
            let mut already = 0;
            for row in rows {
                let n = stmt.execute(params![
                    row.entity_id(),
                    date_to_sql(row.asof_date()),
                    row.schema_version(),
                    run_id,
                    row.canonical_values_json()?,
                ])?;
                if n == 1 { written += 1 } else { already += 1 }
            }
            Ok((written, already))
        })
    }

    /// Every stored row for one as-of date and schema version, by entity.
    pub fn feature_rows(&self, asof: Date, schema_version: &str) -> ChurnResult<Vec<FeatureRow>> {
        self.query_feature_rows(
            "SELECT entity_id, asof_date, schema_version, values_json FROM feature_row
             WHERE asof_date = ?1 AND schema_version = ?2 ORDER BY entity_id",
            params![date_to_sql(asof), schema_version],
        )
    }

    /// Every stored row for a schema version, by (asof, entity).
    pub fn feature_rows_for_schema(&self, schema_version: &str) -> ChurnResult<Vec<FeatureRow>> {
        self.query_feature_rows(
            "SELECT entity_id, asof_date, schema_version, values_json FROM feature_row
             WHERE schema_version = ?1 ORDER BY asof_date, entity_id",
            params![schema_version],
        )
    }

    fn query_feature_rows(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> ChurnResult<Vec<FeatureRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt.query_map(args, |row| {
            let asof: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                date_from_sql(1, &asof)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(entity_id, asof, version, json)| {
                let values: BTreeMap<String, FeatureValue> = serde_json::from_str(&json)?;
                Ok(FeatureRow::new(entity_id, asof, version, values))
            })
            .collect()
    }
}
