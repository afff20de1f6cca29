//! Settlement write path.
//!
//! A settle marks pending cash and/or online collections as received. The
//! change is applied locally first (memory and cache), then sent to the
//! webhook; a failed or malformed answer restores the exact prior state.
//! Nothing is retried automatically: a lost response may hide a settle that
//! already happened remotely, and re-sending it could settle twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{self, LedgerRpc};
use crate::cache::LedgerCache;
use crate::db::DbState;
use crate::error::{LedgerError, Result};
use crate::events::{EventSink, LEDGER_SETTLE_FAILED, LEDGER_SETTLE_SUCCESS};
use crate::ledger::{CanonicalLedgerEntry, SettlementState};
use crate::sync::LedgerState;

const SETTLE_ACTION: &str = "owner_ledger_settle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleMode {
    Cash,
    Online,
    Both,
}

impl SettleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SettleMode::Cash => "cash",
            SettleMode::Online => "online",
            SettleMode::Both => "both",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cash" => Some(SettleMode::Cash),
            "online" | "upi" | "verify" => Some(SettleMode::Online),
            "both" | "all" => Some(SettleMode::Both),
            _ => None,
        }
    }

    fn clears_cash(self) -> bool {
        matches!(self, SettleMode::Cash | SettleMode::Both)
    }

    fn clears_online(self) -> bool {
        matches!(self, SettleMode::Online | SettleMode::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementAction {
    pub group_key: String,
    pub mode: SettleMode,
    /// Entry ids to settle. Empty means every entry in the group.
    #[serde(default)]
    pub affected_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPhase {
    Pending,
    Applied,
    Committed,
    RolledBack,
}

struct Snapshot {
    cache_key: Option<String>,
    entries: Vec<CanonicalLedgerEntry>,
    cache_raw: Option<String>,
    /// State revision right after apply. While unchanged, rollback restores
    /// the cached JSON byte for byte.
    applied_revision: u64,
    /// Remote installs seen at apply. A newer one means the server's view
    /// replaced ours and there is nothing left to commit or undo.
    fetch_installs: u64,
}

/// Put the snapshotted copies of `ids` back into `current`, keeping every
/// other entry as it is now. Order follows the snapshot; entries that only
/// exist in `current` go last.
fn restore_entries(
    snapshot: &[CanonicalLedgerEntry],
    current: &[CanonicalLedgerEntry],
    ids: &[String],
) -> Vec<CanonicalLedgerEntry> {
    let mut restored = Vec::with_capacity(snapshot.len().max(current.len()));
    for before in snapshot {
        if ids.contains(&before.id) {
            restored.push(before.clone());
        } else if let Some(now) = current.iter().find(|e| e.id == before.id) {
            restored.push(now.clone());
        }
    }
    restored.extend(
        current
            .iter()
            .filter(|e| !snapshot.iter().any(|b| b.id == e.id))
            .cloned(),
    );
    restored
}

/// Mark optimistic entries among `ids` that owe nothing as settled.
fn confirm_entries(entries: &mut [CanonicalLedgerEntry], ids: &[String]) -> bool {
    let mut changed = false;
    for entry in entries.iter_mut() {
        if entry.settlement == SettlementState::Optimistic
            && ids.contains(&entry.id)
            && !entry.is_pending()
        {
            entry.settlement = SettlementState::Settled;
            changed = true;
        }
    }
    changed
}

/// One optimistic settle: `apply`, then exactly one of `commit` or
/// `rollback`.
pub struct SettlementCommand<'a> {
    action: SettlementAction,
    state: &'a LedgerState,
    cache: &'a LedgerCache,
    phase: SettlementPhase,
    snapshot: Option<Snapshot>,
    ids: Vec<String>,
}

impl<'a> SettlementCommand<'a> {
    pub fn new(action: SettlementAction, state: &'a LedgerState, cache: &'a LedgerCache) -> Self {
        Self {
            action,
            state,
            cache,
            phase: SettlementPhase::Pending,
            snapshot: None,
            ids: Vec::new(),
        }
    }

    pub fn phase(&self) -> SettlementPhase {
        self.phase
    }

    /// Ids that were matched locally and mutated.
    pub fn affected_ids(&self) -> &[String] {
        &self.ids
    }

    /// Zero the requested channels on every affected entry, drop entries the
    /// current view no longer shows, and persist the result to the cache.
    pub fn apply(&mut self) -> Result<usize> {
        if self.phase != SettlementPhase::Pending {
            return Ok(self.ids.len());
        }
        let mode = self.action.mode;
        let state = self.state;
        let mut inner = state.lock();

        let wanted: HashSet<&str> = self.action.affected_ids.iter().map(String::as_str).collect();
        let is_target = |e: &CanonicalLedgerEntry| {
            if wanted.is_empty() {
                e.group_key == self.action.group_key
            } else {
                wanted.contains(e.id.as_str())
            }
        };
        let ids: Vec<String> = inner
            .entries
            .iter()
            .filter(|&e| is_target(e))
            .map(|e| e.id.clone())
            .collect();
        if ids.is_empty() {
            return Err(LedgerError::NothingToSettle);
        }

        let cache_raw = match &inner.cache_key {
            Some(key) => self.cache.get_raw(key)?,
            None => None,
        };
        let before = inner.entries.clone();
        let status = inner.status();

        let mutated: Vec<CanonicalLedgerEntry> = before
            .iter()
            .cloned()
            .filter_map(|mut e| {
                if !is_target(&e) {
                    return Some(e);
                }
                if mode.clears_cash() {
                    e.cash_pending = 0.0;
                }
                if mode.clears_online() {
                    e.online_pending = 0.0;
                }
                e.settlement = SettlementState::Optimistic;
                status.matches(&e).then_some(e)
            })
            .collect();

        if let Some(key) = inner.cache_key.clone() {
            self.cache.set(&key, &mutated)?;
        }
        inner.entries = mutated;
        inner.revision += 1;

        self.snapshot = Some(Snapshot {
            cache_key: inner.cache_key.clone(),
            entries: before,
            cache_raw,
            applied_revision: inner.revision,
            fetch_installs: inner.fetch_installs,
        });
        self.ids = ids;
        self.phase = SettlementPhase::Applied;
        Ok(self.ids.len())
    }

    /// Remote acknowledged: optimistic entries that owe nothing become settled.
    pub fn commit(&mut self) -> Result<()> {
        if self.phase != SettlementPhase::Applied {
            return Ok(());
        }
        self.phase = SettlementPhase::Committed;
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };

        let state = self.state;
        let mut inner = state.lock();
        if inner.fetch_installs != snapshot.fetch_installs {
            return Ok(());
        }
        if inner.cache_key == snapshot.cache_key {
            if confirm_entries(&mut inner.entries, &self.ids) {
                if let Some(key) = &snapshot.cache_key {
                    self.cache.set(key, &inner.entries)?;
                }
                inner.revision += 1;
            }
        } else if let Some(key) = &snapshot.cache_key {
            // Another cached view is on screen; confirm ours where it is stored.
            if let Some(cached) = self.cache.get(key)? {
                let mut rows = cached.rows;
                if confirm_entries(&mut rows, &self.ids) {
                    self.cache.set(key, &rows)?;
                }
            }
        }
        Ok(())
    }

    /// Undo `apply` for the affected entries. With no change since `apply`
    /// the entries and the cached JSON come back exactly as they were;
    /// otherwise only the affected entries are put back and concurrent
    /// changes to other entries are kept. Skipped when a remote fetch has
    /// replaced the view meanwhile.
    pub fn rollback(&mut self) -> Result<()> {
        if self.phase != SettlementPhase::Applied {
            return Ok(());
        }
        self.phase = SettlementPhase::RolledBack;
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };

        let state = self.state;
        let mut inner = state.lock();
        if inner.fetch_installs != snapshot.fetch_installs {
            warn!(
                group_key = %self.action.group_key,
                "settlement rollback skipped: ledger view was refetched meanwhile"
            );
            return Ok(());
        }

        if inner.revision == snapshot.applied_revision {
            if let Some(key) = &snapshot.cache_key {
                self.cache.restore_raw(key, snapshot.cache_raw.as_deref())?;
            }
            inner.entries = snapshot.entries;
            inner.revision += 1;
            return Ok(());
        }

        if inner.cache_key == snapshot.cache_key {
            let restored = restore_entries(&snapshot.entries, &inner.entries, &self.ids);
            if let Some(key) = &snapshot.cache_key {
                self.cache.set(key, &restored)?;
            }
            inner.entries = restored;
            inner.revision += 1;
        } else if let Some(key) = &snapshot.cache_key {
            if let Some(cached) = self.cache.get(key)? {
                let restored = restore_entries(&snapshot.entries, &cached.rows, &self.ids);
                self.cache.set(key, &restored)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRow {
    pub id: String,
    pub group_key: String,
    pub mode: String,
    pub ids: Vec<String>,
    pub status: String,
    pub error: Option<String>,
    pub created_at: String,
}

fn journal_open(db: &DbState, id: &str, action: &SettlementAction, ids: &[String]) -> Result<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| LedgerError::Cache(e.to_string()))?;
    let ids_json = serde_json::to_string(ids)?;
    conn.execute(
        "INSERT INTO settlement_journal (id, group_key, mode, ids, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'optimistic', datetime('now'), datetime('now'))",
        params![id, action.group_key, action.mode.as_str(), ids_json],
    )
    .map_err(|e| LedgerError::Cache(format!("insert settlement_journal: {e}")))?;
    Ok(())
}

fn journal_close(db: &DbState, id: &str, status: &str, error: Option<&str>) {
    let result = db.conn.lock().map_err(|e| e.to_string()).and_then(|conn| {
        conn.execute(
            "UPDATE settlement_journal SET status = ?2, error = ?3, updated_at = datetime('now')
             WHERE id = ?1",
            params![id, status, error],
        )
        .map_err(|e| e.to_string())
    });
    if let Err(e) = result {
        error!(journal_id = %id, error = %e, "failed to update settlement journal");
    }
}

/// Most recent journal rows, newest first.
pub fn recent_journal(db: &DbState, limit: usize) -> Result<Vec<JournalRow>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| LedgerError::Cache(e.to_string()))?;
    let mut stmt = conn
        .prepare(
            "SELECT id, group_key, mode, ids, status, error, created_at
             FROM settlement_journal ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )
        .map_err(|e| LedgerError::Cache(format!("prepare settlement_journal: {e}")))?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            let ids: String = row.get(3)?;
            Ok(JournalRow {
                id: row.get(0)?,
                group_key: row.get(1)?,
                mode: row.get(2)?,
                ids: serde_json::from_str(&ids).unwrap_or_default(),
                status: row.get(4)?,
                error: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .map_err(|e| LedgerError::Cache(format!("query settlement_journal: {e}")))?;
    let journal: Vec<JournalRow> = rows.flatten().collect();
    Ok(journal)
}

/// Count of journal rows per status, for diagnostics.
pub fn journal_counts(db: &DbState) -> Result<Value> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| LedgerError::Cache(e.to_string()))?;
    let count = |status: &str| -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM settlement_journal WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
        .unwrap_or(0)
    };
    Ok(json!({
        "optimistic": count("optimistic"),
        "settled": count("settled"),
        "rolledBack": count("rolled_back"),
    }))
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub journal_id: String,
    pub group_key: String,
    pub mode: SettleMode,
    pub settled_ids: Vec<String>,
}

/// Removes the group key from the busy set when the settle ends, however it
/// ends.
struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        busy.remove(&self.key);
    }
}

pub struct SettlementCoordinator {
    rpc: Arc<dyn LedgerRpc>,
    state: Arc<LedgerState>,
    cache: LedgerCache,
    db: Arc<DbState>,
    events: Arc<dyn EventSink>,
    settle_timeout: Duration,
    busy: Mutex<HashSet<String>>,
}

impl SettlementCoordinator {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        db: Arc<DbState>,
        state: Arc<LedgerState>,
        events: Arc<dyn EventSink>,
        settle_timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            state,
            cache: LedgerCache::new(db.clone()),
            db,
            events,
            settle_timeout,
            busy: Mutex::new(HashSet::new()),
        }
    }

    /// True while a settle for `group_key` is in flight.
    pub fn is_busy(&self, group_key: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(group_key)
    }

    fn acquire(&self, group_key: &str) -> Result<BusyGuard<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        if !busy.insert(group_key.to_string()) {
            return Err(LedgerError::SettlementInFlight(group_key.to_string()));
        }
        Ok(BusyGuard {
            busy: &self.busy,
            key: group_key.to_string(),
        })
    }

    pub async fn settle(&self, action: SettlementAction) -> Result<SettlementReceipt> {
        let _busy = self.acquire(&action.group_key)?;

        let mut command = SettlementCommand::new(action.clone(), &self.state, &self.cache);
        command.apply()?;
        self.state.invalidate_fetches();

        let ids = if action.affected_ids.is_empty() {
            command.affected_ids().to_vec()
        } else {
            action.affected_ids.clone()
        };
        let journal_id = Uuid::new_v4().to_string();
        if let Err(e) = journal_open(&self.db, &journal_id, &action, &ids) {
            warn!(error = %e, "settlement journal unavailable, continuing without audit row");
        }

        info!(
            group_key = %action.group_key,
            mode = action.mode.as_str(),
            ids = ids.len(),
            "settlement applied optimistically"
        );

        let call = self
            .rpc
            .call(SETTLE_ACTION, json!({ "mode": action.mode.as_str(), "ids": ids }));
        let outcome = match tokio::time::timeout(self.settle_timeout, call).await {
            Err(_) => Err(LedgerError::Timeout(self.settle_timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(resp)) => api::ensure_success(SETTLE_ACTION, &resp),
        };

        match outcome {
            Ok(()) => {
                command.commit()?;
                journal_close(&self.db, &journal_id, "settled", None);
                info!(
                    group_key = %action.group_key,
                    mode = action.mode.as_str(),
                    "settlement confirmed"
                );
                self.events.emit(
                    LEDGER_SETTLE_SUCCESS,
                    json!({
                        "groupKey": action.group_key,
                        "mode": action.mode.as_str(),
                        "ids": ids,
                    }),
                );
                Ok(SettlementReceipt {
                    journal_id,
                    group_key: action.group_key,
                    mode: action.mode,
                    settled_ids: ids,
                })
            }
            Err(e) => {
                if let Err(rollback_err) = command.rollback() {
                    error!(error = %rollback_err, "settlement rollback failed");
                }
                journal_close(&self.db, &journal_id, "rolled_back", Some(&e.to_string()));
                warn!(group_key = %action.group_key, error = %e, "settlement rolled back");
                self.events.emit(
                    LEDGER_SETTLE_FAILED,
                    json!({
                        "groupKey": action.group_key,
                        "mode": action.mode.as_str(),
                        "error": e.to_string(),
                        "message": "Settlement failed. Refresh the ledger before trying again.",
                    }),
                );
                Err(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
