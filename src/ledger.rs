//! Canonical ledger entries.
//!
//! Builds one [`CanonicalLedgerEntry`] per raw row (normalize, aggregate
//! payments, compute balance), derives the group key used as the row's
//! fingerprint, and collapses re-fetched copies of the same transaction.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alias::RecordView;
use crate::balance::{compute_balance, label_for, BalanceLabel};
use crate::money::money_key;
use crate::normalize::{normalize_view, PurchaseType, SourceType, VehicleInfo};
use crate::payments::aggregate_view;

pub const DEFAULT_BUCKET_MINUTES: u32 = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementState {
    Unsettled,
    Optimistic,
    Settled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalLedgerEntry {
    pub id: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub source_id: Option<String>,
    pub branch: String,
    pub staff: String,
    pub customer_name: String,
    pub customer_mobile: String,
    pub purchase_type: PurchaseType,
    #[serde(default)]
    pub vehicle: VehicleInfo,
    pub payment_mode: String,
    #[serde(default)]
    pub reference: Option<String>,
    pub cash_collected: f64,
    pub online_collected: f64,
    pub total_collected: f64,
    pub cash_pending: f64,
    pub online_pending: f64,
    /// `None` when no obligation could be resolved.
    #[serde(default)]
    pub total_due: Option<f64>,
    #[serde(default)]
    pub balance_value: Option<f64>,
    pub balance_label: BalanceLabel,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub group_key: String,
    pub settlement: SettlementState,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl CanonicalLedgerEntry {
    pub fn pending_total(&self) -> f64 {
        crate::money::round_money(self.cash_pending + self.online_pending)
    }

    pub fn is_pending(&self) -> bool {
        self.cash_pending > 0.0 || self.online_pending > 0.0
    }
}

/// Start of the timestamp's bucket, used in place of a missing source id.
fn timestamp_bucket(timestamp: Option<i64>, bucket_minutes: u32) -> String {
    let Some(ts) = timestamp else {
        return String::new();
    };
    let bucket_ms = i64::from(bucket_minutes.max(1)) * 60_000;
    let start = ts.div_euclid(bucket_ms) * bucket_ms;
    let Some(dt) = Utc.timestamp_millis_opt(start).single() else {
        return String::new();
    };
    if bucket_minutes % 1440 == 0 {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M").to_string()
    }
}

pub fn group_key(entry: &CanonicalLedgerEntry, bucket_minutes: u32) -> String {
    let identity = entry
        .source_id
        .clone()
        .unwrap_or_else(|| timestamp_bucket(entry.timestamp, bucket_minutes));
    [
        entry.branch.to_lowercase(),
        entry.staff.to_lowercase(),
        entry.source_type.as_str().to_string(),
        identity,
        entry.customer_mobile.to_lowercase(),
        entry.payment_mode.to_lowercase(),
        money_key(entry.cash_collected),
        money_key(entry.online_collected),
        entry
            .reference
            .as_deref()
            .unwrap_or_default()
            .to_lowercase(),
    ]
    .join("|")
}

/// Build the canonical entry for one raw row. Never fails; problems are
/// recorded in `issues` and raise `needs_review`.
pub fn build_entry(raw: &Value, bucket_minutes: u32) -> CanonicalLedgerEntry {
    let view = RecordView::new(raw);
    let draft = normalize_view(&view);
    let collected = aggregate_view(&view, &draft);
    let balance = compute_balance(&draft, &collected);

    let mut issues = draft.issues.clone();
    if balance.is_none() && !draft.malformed {
        issues.push("total due could not be resolved".to_string());
    }

    let cash_pending = if draft.cash_settled { 0.0 } else { collected.cash };
    let online_pending = if draft.online_verified {
        0.0
    } else {
        collected.online
    };
    let settlement = if cash_pending == 0.0 && online_pending == 0.0 && collected.total > 0.0 {
        SettlementState::Settled
    } else {
        SettlementState::Unsettled
    };

    let reference = collected
        .first_reference()
        .map(str::to_string)
        .or_else(|| draft.reference.clone());

    let mut entry = CanonicalLedgerEntry {
        id: String::new(),
        source_type: draft.source_type,
        source_id: draft.source_id.clone(),
        branch: draft.branch.clone(),
        staff: draft.staff.clone(),
        customer_name: draft.customer_name.clone(),
        customer_mobile: draft.customer_mobile.clone(),
        purchase_type: draft.purchase_type,
        vehicle: draft.vehicle.clone(),
        payment_mode: collected.mode_label().to_string(),
        reference,
        cash_collected: collected.cash,
        online_collected: collected.online,
        total_collected: collected.total,
        cash_pending,
        online_pending,
        total_due: balance.map(|b| b.total_due),
        balance_value: balance.map(|b| b.balance_value),
        balance_label: label_for(&draft),
        timestamp: draft.timestamp,
        group_key: String::new(),
        settlement,
        needs_review: draft.malformed || balance.is_none(),
        issues,
    };
    entry.group_key = group_key(&entry, bucket_minutes);
    entry.id = draft
        .row_id
        .or(draft.source_id)
        .unwrap_or_else(|| entry.group_key.clone());
    entry
}

pub fn build_entries(rows: &[Value], bucket_minutes: u32) -> Vec<CanonicalLedgerEntry> {
    rows.iter()
        .map(|raw| build_entry(raw, bucket_minutes))
        .collect()
}

/// Collapse entries sharing a group key. The latest timestamp wins (a missing
/// timestamp is older than any present one); ties keep the first seen. The
/// surviving entries stay in first-occurrence order.
pub fn dedupe(entries: Vec<CanonicalLedgerEntry>) -> Vec<CanonicalLedgerEntry> {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(entries.len());
    let mut kept: Vec<CanonicalLedgerEntry> = Vec::with_capacity(entries.len());

    for entry in entries {
        match slots.get(&entry.group_key) {
            Some(&idx) => {
                if entry.timestamp > kept[idx].timestamp {
                    kept[idx] = entry;
                }
            }
            None => {
                slots.insert(entry.group_key.clone(), kept.len());
                kept.push(entry);
            }
        }
    }
    kept
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    Unsettled,
    Settled,
    All,
}

impl StatusFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusFilter::Unsettled => "unsettled",
            StatusFilter::Settled => "settled",
            StatusFilter::All => "all",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "settled" => StatusFilter::Settled,
            "all" => StatusFilter::All,
            _ => StatusFilter::Unsettled,
        }
    }

    /// Unsettled rows are those still owing a channel, plus flagged rows that
    /// were never settled so a broken record stays visible.
    pub fn matches(self, entry: &CanonicalLedgerEntry) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Unsettled => {
                entry.is_pending()
                    || (entry.needs_review && entry.settlement == SettlementState::Unsettled)
            }
            StatusFilter::Settled => entry.settlement != SettlementState::Unsettled,
        }
    }
}

pub fn filter_by_status(
    entries: Vec<CanonicalLedgerEntry>,
    status: StatusFilter,
) -> Vec<CanonicalLedgerEntry> {
    entries.into_iter().filter(|e| status.matches(e)).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn booking(ts: &str) -> Value {
        json!({
            "Booking ID": "BK-1",
            "Branch": "Hosur",
            "Executive": "Ravi",
            "Mobile": "9876543210",
            "Total Vehicle Cost": 120000,
            "Booking Amount": 4000,
            "Payment Mode": "Cash",
            "Timestamp": ts,
        })
    }

    #[test]
    fn test_build_entry_fields() {
        let e = build_entry(&booking("2024-05-01T10:15:00Z"), DEFAULT_BUCKET_MINUTES);
        assert_eq!(e.id, "BK-1");
        assert_eq!(e.cash_collected, 4000.0);
        assert_eq!(e.cash_pending, 4000.0);
        assert_eq!(e.payment_mode, "cash");
        assert_eq!(e.balance_value, Some(116000.0));
        assert_eq!(e.settlement, SettlementState::Unsettled);
        assert_eq!(
            e.group_key,
            "hosur|ravi|booking|BK-1|9876543210|cash|4000.00|0.00|"
        );
        assert!(!e.needs_review);
    }

    #[test]
    fn test_duplicate_fetch_keeps_later_copy() {
        let entries = build_entries(
            &[
                booking("2024-05-01T10:15:00Z"),
                booking("2024-05-01T10:16:00Z"),
            ],
            DEFAULT_BUCKET_MINUTES,
        );
        assert_eq!(entries[0].group_key, entries[1].group_key);
        let out = dedupe(entries.clone());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, entries[1].timestamp);

        let reversed = dedupe(vec![entries[1].clone(), entries[0].clone()]);
        assert_eq!(reversed[0].timestamp, entries[1].timestamp);
    }

    #[test]
    fn test_dedupe_is_idempotent_and_keeps_order() {
        let mut other = booking("2024-05-02T09:00:00Z");
        other["Booking ID"] = json!("BK-2");
        let mut missing_ts = booking("");
        missing_ts["Timestamp"] = Value::Null;

        let entries = build_entries(
            &[
                booking("2024-05-01T10:15:00Z"),
                other,
                missing_ts,
                booking("2024-05-01T09:00:00Z"),
            ],
            DEFAULT_BUCKET_MINUTES,
        );
        let once = dedupe(entries);
        assert_eq!(once.len(), 2);
        assert_eq!(once[0].source_id.as_deref(), Some("BK-1"));
        assert_eq!(once[1].source_id.as_deref(), Some("BK-2"));
        assert!(once[0].timestamp.is_some());
        assert_eq!(dedupe(once.clone()), once);
    }

    #[test]
    fn test_changed_amount_is_a_different_entry() {
        let mut changed = booking("2024-05-01T11:00:00Z");
        changed["Booking Amount"] = json!(4500);
        let entries = build_entries(
            &[booking("2024-05-01T10:15:00Z"), changed],
            DEFAULT_BUCKET_MINUTES,
        );
        assert_eq!(dedupe(entries).len(), 2);
    }

    #[test]
    fn test_legacy_rows_use_timestamp_bucket() {
        let raw = json!({
            "Branch": "Hosur",
            "Staff": "Ravi",
            "Cash Amount": 500,
            "Timestamp": "2024-05-01 18:30:00",
        });
        let e = build_entry(&raw, DEFAULT_BUCKET_MINUTES);
        assert!(e.group_key.contains("|2024-05-01|"));
        assert_eq!(e.id, e.group_key);

        let hourly = build_entry(&raw, 60);
        assert!(hourly.group_key.contains("|2024-05-01T18:00|"));
    }

    #[test]
    fn test_settled_channels_have_no_pending() {
        let raw = json!({
            "Booking ID": "BK-5",
            "Total Vehicle Cost": 9000,
            "Cash Amount": 1000,
            "Online Amount": 2000,
            "Cash Settled": "yes",
        });
        let e = build_entry(&raw, DEFAULT_BUCKET_MINUTES);
        assert_eq!(e.cash_pending, 0.0);
        assert_eq!(e.online_pending, 2000.0);
        assert_eq!(e.total_collected, 3000.0);
        assert!(StatusFilter::Unsettled.matches(&e));

        let done = build_entry(
            &json!({ "Booking ID": "BK-6", "Cash Amount": 1000, "status": "Settled" }),
            DEFAULT_BUCKET_MINUTES,
        );
        assert_eq!(done.settlement, SettlementState::Settled);
        assert!(!StatusFilter::Unsettled.matches(&done));
        assert!(StatusFilter::Settled.matches(&done));
    }

    #[test]
    fn test_malformed_rows_surface_for_review() {
        let entries = build_entries(
            &[json!("garbage"), booking("2024-05-01T10:15:00Z")],
            DEFAULT_BUCKET_MINUTES,
        );
        assert_eq!(entries.len(), 2);
        let bad = &entries[0];
        assert!(bad.needs_review);
        assert_eq!(bad.total_collected, 0.0);
        assert_eq!(bad.total_due, None);
        assert_eq!(filter_by_status(entries, StatusFilter::Unsettled).len(), 2);
    }

    #[test]
    fn test_collection_invariants_hold_across_rows() {
        let rows = vec![
            json!({ "payments": [{ "amount": "0.10", "mode": "cash" }, { "amount": 0.2, "mode": "upi" }], "Total Vehicle Cost": 0.25 }),
            json!({ "Purchase Type": "loan", "Total DP": 100, "Booking Amount": 250 }),
            json!({ "bookingAmount1Cash": "1,000.555", "bookingAmount2Online": 99.999 }),
        ];
        for e in build_entries(&rows, DEFAULT_BUCKET_MINUTES) {
            assert_eq!(
                e.total_collected,
                crate::money::round_money(e.cash_collected + e.online_collected)
            );
            if let Some(balance) = e.balance_value {
                assert!(balance >= 0.0);
            }
        }
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let e = build_entry(&booking("2024-05-01T10:15:00Z"), DEFAULT_BUCKET_MINUTES);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["sourceType"], "booking");
        assert_eq!(v["balanceLabel"], "Balance Amount");
        assert_eq!(v["settlement"], "unsettled");
        let back: CanonicalLedgerEntry = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }
}
