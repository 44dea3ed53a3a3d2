use super::{date_from_sql, date_to_sql, events::insert_events, now_stamp, ChurnStore};
use crate::{
    error::{ChurnError, ChurnResult},
    event::RunEvent,
    types::{Date, RunId, SchemaVersion},
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Features,
    Scoring,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Features => "features",
            Self::Scoring  => "scoring",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Aborted,
    Superseded,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started    => "started",
            Self::Completed  => "completed",
            Self::Aborted    => "aborted",
            Self::Superseded => "superseded",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "started"    => Some(Self::Started),
            "completed"  => Some(Self::Completed),
            "aborted"    => Some(Self::Aborted),
            "superseded" => Some(Self::Superseded),
            _            => None,
        }
    }
}

/// Identity of a run's output. At most one completed run exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputKey {
    pub kind:           RunKind,
    pub universe_key:   String,
    /// As-of date for feature runs, run date for scoring runs.
    pub period_date:    Date,
    pub schema_version: SchemaVersion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunManifest {
    pub run_id:         RunId,
    pub key:            OutputKey,
    pub status:         RunStatus,
    pub row_count:      usize,
    pub started_at:     String,
    pub finished_at:    Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This run is now the output of record.
    /// `rows_already_recorded` counts rows an earlier run had written under
    /// the same immutable key; they were left untouched.
    Completed { rows_written: usize, rows_already_recorded: usize },
    /// Another run already completed for the same key; nothing was written.
    Duplicate { of_record_run_id: RunId },
}

impl ChurnStore {
    // ── Manifest ──────────────────────────────────────────────────

    pub fn begin_run(&self, run_id: &str, key: &OutputKey) -> ChurnResult<()> {
        self.conn.execute(
            "INSERT INTO run_manifest (run_id, kind, universe_key, period_date, schema_version, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'started', ?6)",
            params![
                run_id,
                key.kind.as_str(),
                key.universe_key,
                date_to_sql(key.period_date),
                key.schema_version,
                now_stamp(),
            ],
        )?;
        Ok(())
    }

    /// Close a started run without output. Only the abort marker is written.
    pub fn mark_run_aborted(&self, run_id: &str, batches_done: usize) -> ChurnResult<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE run_manifest SET status = 'aborted', finished_at = ?2
             WHERE run_id = ?1 AND status = 'started'",
            params![run_id, now_stamp()],
        )?;
        if changed == 0 {
            return Err(ChurnError::RunNotFound { run_id: run_id.to_string() });
        }
        let seq = next_event_seq(&tx, run_id)?;
        insert_events(&tx, run_id, seq, &[RunEvent::RunAborted {
            run_id: run_id.to_string(),
            batches_done,
        }])?;
        tx.commit()?;
        Ok(())
    }

    pub fn manifest(&self, run_id: &str) -> ChurnResult<RunManifest> {
        self.conn.query_row(
            "SELECT run_id, kind, universe_key, period_date, schema_version, status, row_count, started_at, finished_at
             FROM run_manifest WHERE run_id = ?1",
            params![run_id],
            |row| {
                let kind: String = row.get(1)?;
                let period: String = row.get(3)?;
                let status: String = row.get(5)?;
                let bad_text = |idx: usize, what: String| rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    what.into(),
                );
                Ok(RunManifest {
                    run_id: row.get(0)?,
                    key: OutputKey {
                        kind: match kind.as_str() {
                            "features" => RunKind::Features,
                            "scoring"  => RunKind::Scoring,
                            other      => return Err(bad_text(1, format!("unknown run kind {other}"))),
                        },
                        universe_key:   row.get(2)?,
                        period_date:    date_from_sql(3, &period)?,
                        schema_version: row.get(4)?,
                    },
                    status: RunStatus::parse(&status)
                        .ok_or_else(|| bad_text(5, format!("unknown run status {status}")))?,
                    row_count:   row.get::<_, i64>(6)? as usize,
                    started_at:  row.get(7)?,
                    finished_at: row.get(8)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| ChurnError::RunNotFound { run_id: run_id.to_string() })
    }

    pub fn run_status(&self, run_id: &str) -> ChurnResult<RunStatus> {
        Ok(self.manifest(run_id)?.status)
    }

    /// The completed run currently holding `key`, if any.
    pub fn run_of_record(&self, key: &OutputKey) -> ChurnResult<Option<RunId>> {
        Ok(of_record(&self.conn, key)?)
    }

    // ── Commit protocol ───────────────────────────────────────────

    /// Commit a run's buffered output in one IMMEDIATE transaction:
    ///   1. the run must still be `started`
    ///   2. claim `output_of_record` for the key; losing the claim marks
    ///      the run `superseded` and writes nothing else
    ///   3. `write_rows` inserts the output rows
    ///   4. the buffered events, then `RunCompleted`
    ///   5. flip the manifest to `completed` (the completion marker)
    ///
    /// Readers never observe a partial run: everything lands at step 5's
    /// commit or not at all.
    pub(crate) fn commit_run<F>(
        &self,
        run_id: &str,
        key: &OutputKey,
        events: &[RunEvent],
        write_rows: F,
    ) -> ChurnResult<CommitOutcome>
    where
        F: FnOnce(&Connection) -> ChurnResult<(usize, usize)>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let status: Option<String> = tx.query_row(
            "SELECT status FROM run_manifest WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        ).optional()?;
        match status.as_deref() {
            Some("started") => {}
            Some(other) => {
                return Err(ChurnError::Config(format!("run {run_id} is {other}, cannot commit")));
            }
            None => return Err(ChurnError::RunNotFound { run_id: run_id.to_string() }),
        }

        let claimed = tx.execute(
            "INSERT OR IGNORE INTO output_of_record (kind, universe_key, period_date, schema_version, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.kind.as_str(),
                key.universe_key,
                date_to_sql(key.period_date),
                key.schema_version,
                run_id,
            ],
        )?;
        if claimed == 0 {
            let holder = of_record(&tx, key)?.unwrap_or_default();
            tx.execute(
                "UPDATE run_manifest SET status = 'superseded', finished_at = ?2 WHERE run_id = ?1",
                params![run_id, now_stamp()],
            )?;
            let seq = next_event_seq(&tx, run_id)?;
            insert_events(&tx, run_id, seq, &[RunEvent::RunSuperseded {
                run_id:           run_id.to_string(),
                of_record_run_id: holder.clone(),
            }])?;
            tx.commit()?;
            log::warn!(
                "run {run_id}: {} output for {} / {} already recorded by {holder}",
                key.kind.as_str(), key.universe_key, key.period_date
            );
            return Ok(CommitOutcome::Duplicate { of_record_run_id: holder });
        }

        let (rows_written, rows_already_recorded) = write_rows(&tx)?;

        let seq = next_event_seq(&tx, run_id)?;
        let seq = seq + insert_events(&tx, run_id, seq, events)?;
        insert_events(&tx, run_id, seq, &[RunEvent::RunCompleted {
            run_id: run_id.to_string(),
            rows:   rows_written + rows_already_recorded,
        }])?;

        tx.execute(
            "UPDATE run_manifest SET status = 'completed', row_count = ?2, finished_at = ?3 WHERE run_id = ?1",
            params![run_id, (rows_written + rows_already_recorded) as i64, now_stamp()],
        )?;
        tx.commit()?;

        Ok(CommitOutcome::Completed { rows_written, rows_already_recorded })
    }
}

fn of_record(conn: &Connection, key: &OutputKey) -> rusqlite::Result<Option<RunId>> {
    conn.query_row(
        "SELECT run_id FROM output_of_record
         WHERE kind = ?1 AND universe_key = ?2 AND period_date = ?3 AND schema_version = ?4",
        params![key.kind.as_str(), key.universe_key, date_to_sql(key.period_date), key.schema_version],
        |row| row.get(0),
    ).optional()
}

fn next_event_seq(conn: &Connection, run_id: &str) -> ChurnResult<usize> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq) + 1, 0) FROM run_event WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )?;
    Ok(next as usize)
}
