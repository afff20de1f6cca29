//! Read-through ledger cache.
//!
//! One `ledger_cache` row per (view, filter signature). Rows are written
//! wholesale after every successful fetch or optimistic mutation and read on
//! open for instant paint. The cache is never a source of truth.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::DbState;
use crate::error::{LedgerError, Result};
use crate::ledger::CanonicalLedgerEntry;

/// Stored shape of one cache row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Epoch milliseconds of the fetch or mutation that produced `rows`.
    pub at: i64,
    pub rows: Vec<CanonicalLedgerEntry>,
}

#[derive(Clone)]
pub struct LedgerCache {
    db: Arc<DbState>,
}

impl LedgerCache {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Stable key for a view and its filters. Object keys are sorted by
    /// serde_json, so logically equal filters produce the same key.
    pub fn signature(view: &str, filters: &Value) -> String {
        let canonical = serde_json::json!({ "view": view, "filters": filters });
        let digest = md5::compute(canonical.to_string().as_bytes());
        format!("ledger:{view}:{digest:x}")
    }

    /// Cached rows, or `None` on miss. A row that no longer parses is treated
    /// as a miss.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(cache_key = %key, error = %e, "ledger_cache: discarding unreadable row");
                Ok(None)
            }
        }
    }

    /// Overwrite the row for `key` with `rows`, stamped now.
    pub fn set(&self, key: &str, rows: &[CanonicalLedgerEntry]) -> Result<CacheEntry> {
        let entry = CacheEntry {
            at: Utc::now().timestamp_millis(),
            rows: rows.to_vec(),
        };
        let json = serde_json::to_string(&entry)?;
        self.write_raw(key, &json, entry.at)?;
        debug!(cache_key = %key, rows = rows.len(), "ledger_cache: stored");
        Ok(entry)
    }

    /// The stored JSON text exactly as written.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| LedgerError::Cache(e.to_string()))?;
        conn.query_row(
            "SELECT data FROM ledger_cache WHERE cache_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| LedgerError::Cache(format!("read ledger_cache[{key}]: {e}")))
    }

    /// Put back a snapshot taken with [`get_raw`](Self::get_raw). `None`
    /// removes the row, since there was none before.
    pub fn restore_raw(&self, key: &str, snapshot: Option<&str>) -> Result<()> {
        match snapshot {
            Some(json) => {
                let at = serde_json::from_str::<CacheEntry>(json)
                    .map(|e| e.at)
                    .unwrap_or_else(|_| Utc::now().timestamp_millis());
                self.write_raw(key, json, at)
            }
            None => self.remove(key),
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| LedgerError::Cache(e.to_string()))?;
        conn.execute(
            "DELETE FROM ledger_cache WHERE cache_key = ?1",
            params![key],
        )
        .map_err(|e| LedgerError::Cache(format!("delete ledger_cache[{key}]: {e}")))?;
        Ok(())
    }

    fn write_raw(&self, key: &str, json: &str, at: i64) -> Result<()> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| LedgerError::Cache(e.to_string()))?;
        conn.execute(
            "INSERT INTO ledger_cache (id, cache_key, data, fetched_at, updated_at)
             VALUES (lower(hex(randomblob(16))), ?1, ?2, ?3, datetime('now'))
             ON CONFLICT(cache_key) DO UPDATE SET
                data = excluded.data,
                fetched_at = excluded.fetched_at,
                updated_at = excluded.updated_at",
            params![key, json, at],
        )
        .map_err(|e| LedgerError::Cache(format!("upsert ledger_cache[{key}]: {e}")))?;
        Ok(())
    }

    /// Number of cached views.
    pub fn len(&self) -> Result<usize> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| LedgerError::Cache(e.to_string()))?;
        conn.query_row("SELECT COUNT(*) FROM ledger_cache", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| LedgerError::Cache(format!("count ledger_cache: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::ledger::{build_entries, DEFAULT_BUCKET_MINUTES};
    use serde_json::json;

    fn cache() -> LedgerCache {
        LedgerCache::new(Arc::new(db::test_state()))
    }

    fn rows() -> Vec<CanonicalLedgerEntry> {
        build_entries(
            &[json!({ "Booking ID": "BK-1", "Branch": "Hosur", "Staff": "Ravi", "Cash Amount": 4000 })],
            DEFAULT_BUCKET_MINUTES,
        )
    }

    #[test]
    fn test_signature_is_stable_across_key_order() {
        let a = LedgerCache::signature(
            "owner_ledger_list",
            &json!({ "branch": "Hosur", "status": "unsettled" }),
        );
        let b = LedgerCache::signature(
            "owner_ledger_list",
            &json!({ "status": "unsettled", "branch": "Hosur" }),
        );
        let c = LedgerCache::signature(
            "owner_ledger_list",
            &json!({ "status": "all", "branch": "Hosur" }),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("ledger:owner_ledger_list:"));
    }

    #[test]
    fn test_set_overwrites_wholesale() {
        let cache = cache();
        assert!(cache.get("k").unwrap().is_none());

        cache.set("k", &rows()).unwrap();
        assert_eq!(cache.get("k").unwrap().unwrap().rows.len(), 1);

        cache.set("k", &[]).unwrap();
        assert!(cache.get("k").unwrap().unwrap().rows.is_empty());
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_restore_raw_is_byte_identical() {
        let cache = cache();
        cache.set("k", &rows()).unwrap();
        let before = cache.get_raw("k").unwrap();

        cache.set("k", &[]).unwrap();
        cache.restore_raw("k", before.as_deref()).unwrap();
        assert_eq!(cache.get_raw("k").unwrap(), before);

        cache.set("fresh", &rows()).unwrap();
        cache.restore_raw("fresh", None).unwrap();
        assert!(cache.get_raw("fresh").unwrap().is_none());
    }

    #[test]
    fn test_unreadable_row_is_a_miss() {
        let cache = cache();
        cache.restore_raw("k", Some("{not json")).unwrap();
        assert!(cache.get("k").unwrap().is_none());
    }
}
