//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Pipeline stages buffer their output and hand it to one `commit_*` call;
//! they never execute SQL directly.

mod events;
mod features;
mod recommendations;
mod runs;

pub use recommendations::StoredRecommendation;
pub use runs::{CommitOutcome, OutputKey, RunKind, RunManifest, RunStatus};

use crate::{error::ChurnResult, types::{Date, EntityId}};
use rusqlite::Connection;
use std::time::Duration;

pub struct ChurnStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl ChurnStore {
    pub fn open(path: &str) -> ChurnResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        // Concurrent runs against one file queue on the commit lock.
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> ChurnResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> ChurnResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> ChurnResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_features.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_recommendations.sql"))?;
        Ok(())
    }
}

// ── Column helpers ───────────────────────────────────────────────────────────

pub(crate) fn date_to_sql(d: Date) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn date_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Date> {
    Date::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Universe key ─────────────────────────────────────────────────────────────

/// Order-insensitive identity of an entity universe: `n<count>-<hash>`.
/// Duplicates are ignored.
pub fn universe_key(entity_ids: &[EntityId]) -> String {
    let mut ids: Vec<&str> = entity_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    let mut h: u64 = 14695981039346656037u64;
    for id in &ids {
        for b in id.as_bytes().iter().chain(std::iter::once(&0u8)) {
            h ^= *b as u64;
            h = h.wrapping_mul(1099511628211u64);
        }
    }
    format!("n{}-{:016x}", ids.len(), splitmix64(h))
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universe_key_ignores_order_and_duplicates() {
        let a = universe_key(&["C2".into(), "C1".into(), "C1".into()]);
        let b = universe_key(&["C1".into(), "C2".into()]);
        assert_eq!(a, b);
        assert!(a.starts_with("n2-"));
        assert_ne!(a, universe_key(&["C1".into(), "C3".into()]));
        // separator keeps ["ab","c"] apart from ["a","bc"]
        assert_ne!(universe_key(&["ab".into(), "c".into()]), universe_key(&["a".into(), "bc".into()]));
    }
}
