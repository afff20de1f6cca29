use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{clean, parse_payload, string_list};
use crate::ledger::StatusFilter;
use crate::money::to_money;
use crate::settlement::{self, SettleMode, SettlementAction};
use crate::summary::AggregateFilters;
use crate::sync::{FetchOutcome, LedgerQuery, LedgerView};
use crate::{diagnostics, storage, LedgerEngine};

const DEFAULT_JOURNAL_LIMIT: usize = 20;
const MAX_JOURNAL_LIMIT: usize = 200;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPayload {
    #[serde(default, alias = "action")]
    view: Option<String>,
    #[serde(default, alias = "branchName", alias = "branch_name")]
    branch: Option<String>,
    #[serde(default, alias = "staffName", alias = "staff_name")]
    staff: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "paymentMode", alias = "payment_mode")]
    mode: Option<String>,
    #[serde(default, alias = "cache_only")]
    cache_only: bool,
}

impl ListPayload {
    fn into_query(self) -> Result<LedgerQuery, String> {
        let view = match clean(self.view) {
            Some(raw) => LedgerView::parse(&raw).ok_or(format!("Unknown ledger view: {raw}"))?,
            None => LedgerView::default(),
        };
        Ok(LedgerQuery {
            view,
            branch: clean(self.branch),
            staff: clean(self.staff),
            status: clean(self.status)
                .map(|s| StatusFilter::parse(&s))
                .unwrap_or_default(),
            mode: clean(self.mode),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettlePayload {
    #[serde(default, alias = "group_key", alias = "key")]
    group_key: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default, alias = "ids", alias = "affected_ids")]
    affected_ids: Vec<String>,
}

fn parse_settle_payload(arg0: Option<Value>) -> Result<SettlementAction, String> {
    let payload: SettlePayload = parse_payload(arg0, "settle")?;
    let group_key = clean(payload.group_key).ok_or("Missing groupKey")?;
    let raw_mode = clean(payload.mode).ok_or("Missing mode")?;
    let mode = SettleMode::parse(&raw_mode).ok_or(format!("Invalid settle mode: {raw_mode}"))?;
    let affected_ids = payload
        .affected_ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    Ok(SettlementAction {
        group_key,
        mode,
        affected_ids,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviousDuePayload {
    #[serde(default, alias = "branchName", alias = "branch_name")]
    branch: Option<String>,
    #[serde(default, alias = "staffName", alias = "staff_name")]
    staff: Option<String>,
    #[serde(default, alias = "previousDue", alias = "previous_due")]
    amount: Option<Value>,
}

fn summary_filters(payload: &Value) -> AggregateFilters {
    AggregateFilters {
        branches: string_list(payload.get("branches").or_else(|| payload.get("branch"))),
        staff: string_list(
            payload
                .get("staff")
                .or_else(|| payload.get("staffNames"))
                .or_else(|| payload.get("staff_names")),
        ),
    }
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

/// Paint from cache, then refresh from the webhook. When the webhook is
/// unreachable the cached rows are returned marked `stale`.
pub async fn ledger_list(arg0: Option<Value>, engine: &LedgerEngine) -> Result<Value, String> {
    let payload: ListPayload = parse_payload(arg0, "ledger list")?;
    let cache_only = payload.cache_only;
    let query = payload.into_query()?;
    let sync = engine.sync();

    let cached = sync.instant_paint(&query).unwrap_or_else(|e| {
        warn!(error = %e, "ledger: cache read failed, skipping instant paint");
        None
    });
    if cache_only {
        return Ok(match cached {
            Some(c) => json!({
                "success": true,
                "source": "cache",
                "cachedAt": c.at,
                "count": c.rows.len(),
                "data": c.rows,
            }),
            None => json!({ "success": true, "source": "cache", "count": 0, "data": [] }),
        });
    }

    match sync.refresh(&query).await {
        Ok(FetchOutcome::Fresh(entries)) => Ok(json!({
            "success": true,
            "source": "remote",
            "count": entries.len(),
            "data": entries,
        })),
        Ok(FetchOutcome::Superseded) => {
            let entries = engine.state().entries();
            Ok(json!({
                "success": true,
                "source": "superseded",
                "count": entries.len(),
                "data": entries,
            }))
        }
        Ok(FetchOutcome::Rejected { message }) => Ok(json!({
            "success": false,
            "source": "remote",
            "count": 0,
            "data": [],
            "message": message,
        })),
        Err(e) => match cached {
            Some(c) => Ok(json!({
                "success": true,
                "source": "cache",
                "stale": true,
                "cachedAt": c.at,
                "count": c.rows.len(),
                "data": c.rows,
                "error": e.to_string(),
            })),
            None => Err(e.to_string()),
        },
    }
}

/// Staff/branch totals over the current view. Pass `refreshPreviousDues`
/// to reload previous dues first.
pub async fn ledger_summary(arg0: Option<Value>, engine: &LedgerEngine) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| json!({}));
    let filters = summary_filters(&payload);

    let reload = payload
        .get("refreshPreviousDues")
        .or_else(|| payload.get("refresh_previous_dues"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if reload {
        if let Err(e) = engine.sync().previous_dues(None, None).await {
            warn!(error = %e, "ledger: previous dues unavailable, using last known values");
        }
    }

    let summary = engine.sync().summary(&filters);
    Ok(json!({ "success": true, "data": summary }))
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

pub async fn ledger_settle(arg0: Option<Value>, engine: &LedgerEngine) -> Result<Value, String> {
    let action = parse_settle_payload(arg0)?;
    let receipt = engine
        .settlement()
        .settle(action)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "success": true, "data": receipt }))
}

/// Whether a settle for the group is still in flight.
pub async fn ledger_settle_status(
    arg0: Option<Value>,
    engine: &LedgerEngine,
) -> Result<Value, String> {
    let payload: SettlePayload = parse_payload(arg0, "settle status")?;
    let group_key = clean(payload.group_key).ok_or("Missing groupKey")?;
    let busy = engine.settlement().is_busy(&group_key);
    Ok(json!({ "groupKey": group_key, "busy": busy }))
}

pub async fn ledger_journal(arg0: Option<Value>, engine: &LedgerEngine) -> Result<Value, String> {
    let limit = arg0
        .as_ref()
        .and_then(|p| p.get("limit"))
        .and_then(Value::as_u64)
        .map(|n| (n as usize).clamp(1, MAX_JOURNAL_LIMIT))
        .unwrap_or(DEFAULT_JOURNAL_LIMIT);
    let rows = settlement::recent_journal(engine.db(), limit).map_err(|e| e.to_string())?;
    Ok(json!({ "success": true, "data": rows }))
}

// ---------------------------------------------------------------------------
// Previous dues
// ---------------------------------------------------------------------------

pub async fn ledger_prev_due_list(
    arg0: Option<Value>,
    engine: &LedgerEngine,
) -> Result<Value, String> {
    let payload: PreviousDuePayload = parse_payload(arg0, "previous due list")?;
    let branch = clean(payload.branch);
    let staff = clean(payload.staff);
    let dues = engine
        .sync()
        .previous_dues(branch.as_deref(), staff.as_deref())
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "success": true, "data": dues }))
}

pub async fn ledger_prev_due_set(
    arg0: Option<Value>,
    engine: &LedgerEngine,
) -> Result<Value, String> {
    let payload: PreviousDuePayload = parse_payload(arg0, "previous due")?;
    let branch = clean(payload.branch).ok_or("Missing branch")?;
    let staff = clean(payload.staff).ok_or("Missing staff")?;
    let amount = payload
        .amount
        .as_ref()
        .and_then(to_money)
        .filter(|a| *a >= 0.0)
        .ok_or("Invalid amount")?;
    engine
        .sync()
        .set_previous_due(&branch, &staff, amount)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// Settings and diagnostics
// ---------------------------------------------------------------------------

pub async fn ledger_diagnostics(engine: &LedgerEngine) -> Result<Value, String> {
    let health = diagnostics::get_ledger_health(engine.db().clone())?;
    Ok(json!({
        "about": diagnostics::get_about_info(),
        "health": health,
    }))
}

pub async fn ledger_export_diagnostics(
    arg0: Option<Value>,
    engine: &LedgerEngine,
) -> Result<Value, String> {
    let output_dir = arg0
        .as_ref()
        .and_then(|p| p.get("outputDir").or_else(|| p.get("output_dir")))
        .and_then(Value::as_str)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| engine.config().data_dir.join("diagnostics"));
    let path = diagnostics::export_diagnostics(engine.db().clone(), engine.config(), &output_dir)?;
    Ok(json!({ "success": true, "path": path }))
}

/// Stored webhook credentials, token masked.
pub async fn ledger_credentials_get() -> Result<Value, String> {
    Ok(storage::get_webhook_summary())
}

/// Store webhook credentials in the OS keyring. They are read on the next
/// engine start.
pub async fn ledger_credentials_set(arg0: Option<Value>) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing credentials payload")?;
    storage::update_webhook_credentials(&payload)
}

pub async fn ledger_credentials_reset() -> Result<Value, String> {
    storage::factory_reset()
}
