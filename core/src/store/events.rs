use super::ChurnStore;
use crate::{
    error::ChurnResult,
    event::{EventLogEntry, RunEvent},
};
use rusqlite::{params, Connection};

/// Append `events` for `run_id` starting at `start_seq`. Returns how many
/// were written.
pub(crate) fn insert_events(
    conn: &Connection,
    run_id: &str,
    start_seq: usize,
    events: &[RunEvent],
) -> ChurnResult<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO run_event (run_id, seq, event_type, payload) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (i, event) in events.iter().enumerate() {
        let entry = EventLogEntry::from_event(run_id, start_seq + i, event)?;
        stmt.execute(params![entry.run_id, entry.seq as i64, entry.event_type, entry.payload])?;
    }
    Ok(events.len())
}

impl ChurnStore {
    // ── Audit trail ───────────────────────────────────────────────

    pub fn events_for_run(&self, run_id: &str) -> ChurnResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, seq, event_type, payload FROM run_event
             WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(EventLogEntry {
                id:         Some(row.get(0)?),
                run_id:     row.get(1)?,
                seq:        row.get::<_, i64>(2)? as usize,
                event_type: row.get(3)?,
                payload:    row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Count a run's events of one type.
    pub fn count_events(&self, run_id: &str, event_type: &str) -> ChurnResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM run_event WHERE run_id = ?1 AND event_type = ?2",
            params![run_id, event_type],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}
