//! Ledger read path.
//!
//! Paints from the local cache first, then fetches from the webhook and
//! replaces both the in-memory view and the cache wholesale. Fetches carry a
//! generation ticket; a result that arrives after a newer fetch was issued
//! is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::alias::{Field, RecordView};
use crate::api::{self, LedgerRpc};
use crate::cache::{CacheEntry, LedgerCache};
use crate::db::{self, DbState};
use crate::error::{LedgerError, Result};
use crate::events::{EventSink, LEDGER_FETCH_FAILED, LEDGER_UPDATED};
use crate::ledger::{build_entries, dedupe, filter_by_status, CanonicalLedgerEntry, StatusFilter};
use crate::money::round_money;
use crate::summary::{
    aggregate_by_channel, aggregate_by_staff_branch, apply_previous_dues, AggregateFilters,
    ChannelTotals, PreviousDue, StaffBranchAggregate,
};

const PREV_DUE_LIST_ACTION: &str = "owner_prev_due_list";
const PREV_DUE_SET_ACTION: &str = "owner_prev_due_set";
const SETTINGS_CATEGORY: &str = "ledger";
const SETTINGS_PREVIOUS_DUES: &str = "previous_dues";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LedgerView {
    #[default]
    OwnerList,
    StaffSummary,
    StaffTransactions,
}

impl LedgerView {
    /// Remote action that serves this view.
    pub fn action(self) -> &'static str {
        match self {
            LedgerView::OwnerList => "owner_ledger_list",
            LedgerView::StaffSummary => "staff_ledger_summary",
            LedgerView::StaffTransactions => "staff_ledger_transactions",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "owner_ledger_list" | "ownerList" | "owner" => Some(LedgerView::OwnerList),
            "staff_ledger_summary" | "staffSummary" => Some(LedgerView::StaffSummary),
            "staff_ledger_transactions" | "staffTransactions" | "staff" => {
                Some(LedgerView::StaffTransactions)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    #[serde(default)]
    pub view: LedgerView,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub staff: Option<String>,
    #[serde(default)]
    pub status: StatusFilter,
    #[serde(default)]
    pub mode: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl LedgerQuery {
    /// Parameters sent with the view's action.
    pub fn params(&self) -> Value {
        let mut params = Map::new();
        if let Some(branch) = non_blank(&self.branch) {
            params.insert("branch".into(), json!(branch));
        }
        if let Some(staff) = non_blank(&self.staff) {
            params.insert("staff".into(), json!(staff));
        }
        params.insert("status".into(), json!(self.status.as_str()));
        if let Some(mode) = non_blank(&self.mode) {
            params.insert("mode".into(), json!(mode.to_lowercase()));
        }
        Value::Object(params)
    }

    pub fn cache_key(&self) -> String {
        LedgerCache::signature(self.view.action(), &self.params())
    }
}

// ---------------------------------------------------------------------------
// Shared in-memory view
// ---------------------------------------------------------------------------

/// What the operator is currently looking at.
#[derive(Debug, Default)]
pub struct LedgerStateInner {
    pub cache_key: Option<String>,
    pub query: Option<LedgerQuery>,
    pub entries: Vec<CanonicalLedgerEntry>,
    pub previous_dues: Vec<PreviousDue>,
    /// Bumped on every install or mutation of `entries`.
    pub revision: u64,
    /// Bumped only when a remote fetch replaces the view.
    pub fetch_installs: u64,
}

impl LedgerStateInner {
    pub fn install(&mut self, key: String, query: LedgerQuery, entries: Vec<CanonicalLedgerEntry>) {
        self.cache_key = Some(key);
        self.query = Some(query);
        self.entries = entries;
        self.revision += 1;
    }

    /// Install rows that came from the remote store.
    pub fn install_fetched(
        &mut self,
        key: String,
        query: LedgerQuery,
        entries: Vec<CanonicalLedgerEntry>,
    ) {
        self.install(key, query, entries);
        self.fetch_installs += 1;
    }

    pub fn status(&self) -> StatusFilter {
        self.query.as_ref().map(|q| q.status).unwrap_or_default()
    }
}

/// State shared by the read path and the settlement coordinator.
#[derive(Debug, Default)]
pub struct LedgerState {
    inner: Mutex<LedgerStateInner>,
    generation: AtomicU64,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, LedgerStateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a ticket for a new fetch, superseding any fetch in flight.
    pub fn begin_fetch(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }

    /// Drop the result of any fetch in flight. Used before an optimistic
    /// write so a stale read cannot overwrite it.
    pub fn invalidate_fetches(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<CanonicalLedgerEntry> {
        self.lock().entries.clone()
    }
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fresh(Vec<CanonicalLedgerEntry>),
    /// A newer fetch was issued while this one was in flight.
    Superseded,
    /// The remote answered `success: false`; nothing was changed.
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub staff: Vec<StaffBranchAggregate>,
    pub channels: ChannelTotals,
    pub previous_due_total: f64,
}

pub struct LedgerSync {
    rpc: Arc<dyn LedgerRpc>,
    cache: LedgerCache,
    db: Arc<DbState>,
    state: Arc<LedgerState>,
    events: Arc<dyn EventSink>,
    bucket_minutes: u32,
}

impl LedgerSync {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        db: Arc<DbState>,
        state: Arc<LedgerState>,
        events: Arc<dyn EventSink>,
        bucket_minutes: u32,
    ) -> Self {
        Self {
            rpc,
            cache: LedgerCache::new(db.clone()),
            db,
            state,
            events,
            bucket_minutes,
        }
    }

    pub fn state(&self) -> &Arc<LedgerState> {
        &self.state
    }

    /// Install cached rows for `query` as the current view, if any exist.
    pub fn instant_paint(&self, query: &LedgerQuery) -> Result<Option<CacheEntry>> {
        let key = query.cache_key();
        let Some(cached) = self.cache.get(&key)? else {
            debug!(view = query.view.action(), "ledger: no cached rows for instant paint");
            return Ok(None);
        };
        self.state
            .lock()
            .install(key, query.clone(), cached.rows.clone());
        debug!(
            view = query.view.action(),
            rows = cached.rows.len(),
            cached_at = cached.at,
            "ledger: painted from cache"
        );
        Ok(Some(cached))
    }

    /// Fetch `query` from the remote store and make it the current view.
    pub async fn refresh(&self, query: &LedgerQuery) -> Result<FetchOutcome> {
        let ticket = self.state.begin_fetch();
        let action = query.view.action();

        let resp = match self.rpc.call(action, query.params()).await {
            Ok(resp) => resp,
            Err(e) => {
                if !self.state.is_current(ticket) {
                    return Ok(FetchOutcome::Superseded);
                }
                warn!(action = %action, error = %e, "ledger fetch failed");
                self.events.emit(
                    LEDGER_FETCH_FAILED,
                    json!({ "view": action, "error": e.to_string() }),
                );
                return Err(e);
            }
        };

        let rows = match api::unwrap_rows(action, &resp) {
            Ok(rows) => rows,
            Err(LedgerError::RemoteRejection { message, .. }) => {
                if !self.state.is_current(ticket) {
                    return Ok(FetchOutcome::Superseded);
                }
                warn!(action = %action, message = %message, "ledger fetch rejected by remote");
                return Ok(FetchOutcome::Rejected { message });
            }
            Err(e) => {
                if self.state.is_current(ticket) {
                    self.events.emit(
                        LEDGER_FETCH_FAILED,
                        json!({ "view": action, "error": e.to_string() }),
                    );
                }
                return Err(e);
            }
        };

        let fetched = rows.len();
        let entries = filter_by_status(
            dedupe(build_entries(&rows, self.bucket_minutes)),
            query.status,
        );

        let key = query.cache_key();
        {
            let mut inner = self.state.lock();
            if !self.state.is_current(ticket) {
                debug!(action = %action, "ledger fetch superseded, discarding result");
                return Ok(FetchOutcome::Superseded);
            }
            inner.install_fetched(key.clone(), query.clone(), entries.clone());
            self.cache.set(&key, &entries)?;
        }

        let review = entries.iter().filter(|e| e.needs_review).count();
        info!(
            action = %action,
            fetched,
            rows = entries.len(),
            needs_review = review,
            "ledger refreshed"
        );
        self.events.emit(
            LEDGER_UPDATED,
            json!({ "view": action, "rows": entries.len(), "needsReview": review }),
        );
        Ok(FetchOutcome::Fresh(entries))
    }

    /// Fetch previous-due adjustments and remember them for summaries.
    pub async fn previous_dues(
        &self,
        branch: Option<&str>,
        staff: Option<&str>,
    ) -> Result<Vec<PreviousDue>> {
        let mut params = Map::new();
        if let Some(branch) = branch.filter(|s| !s.trim().is_empty()) {
            params.insert("branch".into(), json!(branch));
        }
        if let Some(staff) = staff.filter(|s| !s.trim().is_empty()) {
            params.insert("staff".into(), json!(staff));
        }
        let resp = self
            .rpc
            .call(PREV_DUE_LIST_ACTION, Value::Object(params))
            .await?;
        let dues: Vec<PreviousDue> = api::unwrap_rows(PREV_DUE_LIST_ACTION, &resp)?
            .iter()
            .filter_map(parse_previous_due)
            .collect();

        debug!(count = dues.len(), "ledger: previous dues loaded");
        self.remember_previous_dues(dues.clone());
        Ok(dues)
    }

    /// Set the previous due for one (branch, staff) pair.
    pub async fn set_previous_due(&self, branch: &str, staff: &str, amount: f64) -> Result<()> {
        let amount = round_money(amount.max(0.0));
        let resp = self
            .rpc
            .call(
                PREV_DUE_SET_ACTION,
                json!({ "branch": branch, "staff": staff, "amount": amount }),
            )
            .await?;
        api::ensure_success(PREV_DUE_SET_ACTION, &resp)?;

        let mut dues = self.known_previous_dues();
        let (b, s) = (branch.to_lowercase(), staff.to_lowercase());
        match dues
            .iter_mut()
            .find(|d| d.branch.to_lowercase() == b && d.staff.to_lowercase() == s)
        {
            Some(existing) => existing.amount = amount,
            None => dues.push(PreviousDue {
                branch: branch.to_string(),
                staff: staff.to_string(),
                amount,
            }),
        }
        info!(branch = %branch, staff = %staff, amount, "ledger: previous due set");
        self.remember_previous_dues(dues);
        Ok(())
    }

    /// Aggregate the current view, folding in the last known previous dues.
    pub fn summary(&self, filters: &AggregateFilters) -> LedgerSummary {
        let entries = self.state.entries();
        let dues = self.known_previous_dues();
        let staff = apply_previous_dues(
            aggregate_by_staff_branch(&entries, filters),
            &dues,
            filters,
        );
        let previous_due_total = round_money(staff.iter().map(|r| r.previous_due).sum());
        LedgerSummary {
            staff,
            channels: aggregate_by_channel(&entries),
            previous_due_total,
        }
    }

    fn known_previous_dues(&self) -> Vec<PreviousDue> {
        let in_memory = self.state.lock().previous_dues.clone();
        if !in_memory.is_empty() {
            return in_memory;
        }
        let stored = match self.db.conn.lock() {
            Ok(conn) => db::get_setting(&conn, SETTINGS_CATEGORY, SETTINGS_PREVIOUS_DUES),
            Err(e) => {
                warn!("ledger: settings lock failed: {e}");
                None
            }
        };
        stored
            .and_then(|json| serde_json::from_str::<Vec<PreviousDue>>(&json).ok())
            .unwrap_or_default()
    }

    fn remember_previous_dues(&self, dues: Vec<PreviousDue>) {
        if let Ok(json) = serde_json::to_string(&dues) {
            match self.db.conn.lock() {
                Ok(conn) => {
                    if let Err(e) =
                        db::set_setting(&conn, SETTINGS_CATEGORY, SETTINGS_PREVIOUS_DUES, &json)
                    {
                        warn!("ledger: failed to persist previous dues: {e}");
                    }
                }
                Err(e) => warn!("ledger: settings lock failed: {e}"),
            }
        }
        self.state.lock().previous_dues = dues;
    }
}

fn parse_previous_due(row: &Value) -> Option<PreviousDue> {
    let view = RecordView::new(row);
    Some(PreviousDue {
        branch: view.resolve_str(Field::Branch)?,
        staff: view.resolve_str(Field::Staff)?,
        amount: round_money(view.resolve_money(Field::PreviousDue)?.max(0.0)),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeRpc;
    use crate::events::BroadcastEventSink;
    use std::time::Duration;

    struct Harness {
        rpc: Arc<FakeRpc>,
        sink: BroadcastEventSink,
        sync: LedgerSync,
    }

    fn harness() -> Harness {
        let rpc = Arc::new(FakeRpc::default());
        let sink = BroadcastEventSink::default();
        let sync = LedgerSync::new(
            rpc.clone(),
            Arc::new(db::test_state()),
            Arc::new(LedgerState::new()),
            Arc::new(sink.clone()),
            crate::ledger::DEFAULT_BUCKET_MINUTES,
        );
        Harness { rpc, sink, sync }
    }

    fn rows() -> Value {
        json!({
            "success": true,
            "rows": [
                { "Booking ID": "BK-1", "Branch": "Hosur", "Staff": "Ravi", "Cash Amount": 4000, "Timestamp": "2024-05-01T10:00:00Z" },
                { "Booking ID": "BK-1", "Branch": "Hosur", "Staff": "Ravi", "Cash Amount": 4000, "Timestamp": "2024-05-01T10:01:00Z" },
                { "Booking ID": "BK-2", "Branch": "Hosur", "Staff": "Meena", "Online Amount": 1500 },
                { "Booking ID": "BK-3", "Branch": "Hosur", "Staff": "Meena", "Cash Amount": 700, "status": "settled" },
            ]
        })
    }

    #[test]
    fn test_query_params_and_key() {
        let q = LedgerQuery {
            branch: Some(" Hosur ".into()),
            staff: Some("".into()),
            mode: Some("CASH".into()),
            ..Default::default()
        };
        assert_eq!(
            q.params(),
            json!({ "branch": "Hosur", "status": "unsettled", "mode": "cash" })
        );
        let other = LedgerQuery {
            status: StatusFilter::All,
            ..q.clone()
        };
        assert_ne!(q.cache_key(), other.cache_key());
        assert_eq!(LedgerView::parse("staff_ledger_summary"), Some(LedgerView::StaffSummary));
    }

    #[tokio::test]
    async fn test_refresh_dedupes_filters_and_caches() {
        let h = harness();
        h.rpc.reply("owner_ledger_list", rows());
        let query = LedgerQuery::default();

        let FetchOutcome::Fresh(entries) = h.sync.refresh(&query).await.unwrap() else {
            panic!("expected fresh rows");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(h.sync.state().entries(), entries);

        let calls = h.rpc.calls();
        assert_eq!(calls[0].0, "owner_ledger_list");
        assert_eq!(calls[0].1["status"], "unsettled");

        // A fresh engine over the same cache paints immediately.
        let state = Arc::new(LedgerState::new());
        let painter = LedgerSync::new(
            h.rpc.clone(),
            h.sync.db.clone(),
            state.clone(),
            Arc::new(BroadcastEventSink::default()),
            crate::ledger::DEFAULT_BUCKET_MINUTES,
        );
        let painted = painter.instant_paint(&query).unwrap().unwrap();
        assert_eq!(painted.rows, entries);
        assert_eq!(state.entries(), entries);
    }

    #[tokio::test]
    async fn test_network_failure_leaves_state_and_cache() {
        let h = harness();
        let query = LedgerQuery::default();
        h.rpc.reply("owner_ledger_list", rows());
        h.sync.refresh(&query).await.unwrap();
        let before_entries = h.sync.state().entries();
        let before_cache = h.sync.cache.get_raw(&query.cache_key()).unwrap();

        let mut rx = h.sink.subscribe();
        h.rpc.fail(
            "owner_ledger_list",
            LedgerError::Timeout(Duration::from_secs(30)),
        );
        assert!(h.sync.refresh(&query).await.is_err());
        assert_eq!(h.sync.state().entries(), before_entries);
        assert_eq!(h.sync.cache.get_raw(&query.cache_key()).unwrap(), before_cache);
        assert_eq!(rx.try_recv().unwrap().event, LEDGER_FETCH_FAILED);
    }

    #[tokio::test]
    async fn test_rejection_is_empty_result() {
        let h = harness();
        let query = LedgerQuery::default();
        h.rpc.reply("owner_ledger_list", rows());
        h.sync.refresh(&query).await.unwrap();

        h.rpc.reply("owner_ledger_list", json!({ "success": false, "error": "quota" }));
        let outcome = h.sync.refresh(&query).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Rejected {
                message: "quota".into()
            }
        );
        assert_eq!(h.sync.state().entries().len(), 2);
    }

    #[tokio::test]
    async fn test_superseded_fetch_is_discarded() {
        let h = harness();
        let slow = LedgerQuery::default();
        let fast = LedgerQuery {
            status: StatusFilter::All,
            ..Default::default()
        };
        h.rpc.script("owner_ledger_list", Duration::from_millis(150), Ok(rows()));
        h.rpc.script(
            "owner_ledger_list",
            Duration::ZERO,
            Ok(json!({ "success": true, "rows": [] })),
        );

        let (first, second) = tokio::join!(h.sync.refresh(&slow), h.sync.refresh(&fast));
        assert_eq!(first.unwrap(), FetchOutcome::Superseded);
        assert_eq!(second.unwrap(), FetchOutcome::Fresh(vec![]));
        assert!(h.sync.state().entries().is_empty());
        assert_eq!(h.sync.state().lock().query.as_ref(), Some(&fast));
        assert!(h.sync.cache.get(&slow.cache_key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_summary_includes_previous_dues() {
        let h = harness();
        h.rpc.reply("owner_ledger_list", rows());
        h.rpc.reply(
            "owner_prev_due_list",
            json!({ "success": true, "rows": [
                { "Branch": "Hosur", "Staff": "Ravi", "Previous Due": "2,000" },
                { "Branch": "Hosur" },
            ]}),
        );
        h.rpc.reply("owner_prev_due_set", json!({ "success": true }));

        h.sync.refresh(&LedgerQuery::default()).await.unwrap();
        let dues = h.sync.previous_dues(Some("Hosur"), None).await.unwrap();
        assert_eq!(dues.len(), 1);

        h.sync.set_previous_due("Hosur", "Meena", 300.0).await.unwrap();
        let summary = h.sync.summary(&AggregateFilters::default());
        assert_eq!(summary.staff[0].staff, "Ravi");
        assert_eq!(summary.staff[0].total_pending, 6000.0);
        assert_eq!(summary.staff[1].total_pending, 1800.0);
        assert_eq!(summary.channels.total_pending, 5500.0);
        assert_eq!(summary.previous_due_total, 2300.0);

        // Dues survive a restart through local settings.
        h.sync.state().lock().previous_dues.clear();
        assert_eq!(h.sync.known_previous_dues().len(), 2);
    }
}
