//! Staff/branch and channel summaries over canonical entries.
//!
//! Everything here is a pure fold over its inputs; summaries are rebuilt on
//! every read and never stored.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ledger::CanonicalLedgerEntry;
use crate::money::round_money;

/// Optional allow-lists. Empty means no restriction; matching ignores case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateFilters {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub staff: Vec<String>,
}

impl AggregateFilters {
    fn allow(list: &[String]) -> Option<HashSet<String>> {
        let set: HashSet<String> = list
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        (!set.is_empty()).then_some(set)
    }

    pub fn admits(&self, branch: &str, staff: &str) -> bool {
        let branch_ok = Self::allow(&self.branches)
            .map(|set| set.contains(&branch.to_lowercase()))
            .unwrap_or(true);
        let staff_ok = Self::allow(&self.staff)
            .map(|set| set.contains(&staff.to_lowercase()))
            .unwrap_or(true);
        branch_ok && staff_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffBranchAggregate {
    pub branch: String,
    pub staff: String,
    pub cash_pending: f64,
    pub online_pending: f64,
    #[serde(default)]
    pub previous_due: f64,
    pub total_pending: f64,
    pub entry_count: usize,
}

impl StaffBranchAggregate {
    fn empty(branch: &str, staff: &str) -> Self {
        Self {
            branch: branch.to_string(),
            staff: staff.to_string(),
            cash_pending: 0.0,
            online_pending: 0.0,
            previous_due: 0.0,
            total_pending: 0.0,
            entry_count: 0,
        }
    }

    fn key(&self) -> (String, String) {
        pair_key(&self.branch, &self.staff)
    }

    fn recompute_total(&mut self) {
        self.cash_pending = round_money(self.cash_pending);
        self.online_pending = round_money(self.online_pending);
        self.previous_due = round_money(self.previous_due);
        self.total_pending =
            round_money(self.cash_pending + self.online_pending + self.previous_due);
    }
}

fn pair_key(branch: &str, staff: &str) -> (String, String) {
    (branch.trim().to_lowercase(), staff.trim().to_lowercase())
}

fn sort_for_display(rows: &mut [StaffBranchAggregate]) {
    rows.sort_by(|a, b| {
        b.total_pending
            .total_cmp(&a.total_pending)
            .then_with(|| a.branch.to_lowercase().cmp(&b.branch.to_lowercase()))
            .then_with(|| a.staff.to_lowercase().cmp(&b.staff.to_lowercase()))
    });
}

/// One row per distinct (branch, staff), highest pending first. Only pending
/// (unsettled) amounts are summed.
pub fn aggregate_by_staff_branch(
    entries: &[CanonicalLedgerEntry],
    filters: &AggregateFilters,
) -> Vec<StaffBranchAggregate> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut rows: Vec<StaffBranchAggregate> = Vec::new();

    for entry in entries {
        if !entry.is_pending() || !filters.admits(&entry.branch, &entry.staff) {
            continue;
        }
        let key = pair_key(&entry.branch, &entry.staff);
        let idx = *index.entry(key).or_insert_with(|| {
            rows.push(StaffBranchAggregate::empty(&entry.branch, &entry.staff));
            rows.len() - 1
        });
        let row = &mut rows[idx];
        row.cash_pending += entry.cash_pending;
        row.online_pending += entry.online_pending;
        row.entry_count += 1;
    }

    rows.iter_mut().for_each(StaffBranchAggregate::recompute_total);
    sort_for_display(&mut rows);
    rows
}

/// Merge two aggregate lists as if they had been computed over the union of
/// their entries.
pub fn merge_aggregates(
    a: Vec<StaffBranchAggregate>,
    b: Vec<StaffBranchAggregate>,
) -> Vec<StaffBranchAggregate> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut rows: Vec<StaffBranchAggregate> = Vec::new();

    for row in a.into_iter().chain(b) {
        match index.get(&row.key()) {
            Some(&idx) => {
                let target = &mut rows[idx];
                target.cash_pending += row.cash_pending;
                target.online_pending += row.online_pending;
                target.previous_due += row.previous_due;
                target.entry_count += row.entry_count;
            }
            None => {
                index.insert(row.key(), rows.len());
                rows.push(row);
            }
        }
    }

    rows.iter_mut().for_each(StaffBranchAggregate::recompute_total);
    sort_for_display(&mut rows);
    rows
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTotals {
    pub cash_pending: f64,
    pub online_pending: f64,
    pub total_pending: f64,
    pub entry_count: usize,
}

pub fn aggregate_by_channel(entries: &[CanonicalLedgerEntry]) -> ChannelTotals {
    let pending: Vec<&CanonicalLedgerEntry> = entries.iter().filter(|e| e.is_pending()).collect();
    let (cash, online) = pending.iter().fold((0.0, 0.0), |(c, o), e| {
        (c + e.cash_pending, o + e.online_pending)
    });
    let cash_pending = round_money(cash);
    let online_pending = round_money(online);
    ChannelTotals {
        cash_pending,
        online_pending,
        total_pending: round_money(cash_pending + online_pending),
        entry_count: pending.len(),
    }
}

/// Opening-balance adjustment kept remotely per (branch, staff).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousDue {
    pub branch: String,
    pub staff: String,
    pub amount: f64,
}

/// Fold previous dues into the aggregates. A due for a pair with no entries
/// still produces a row.
pub fn apply_previous_dues(
    aggregates: Vec<StaffBranchAggregate>,
    dues: &[PreviousDue],
    filters: &AggregateFilters,
) -> Vec<StaffBranchAggregate> {
    let due_rows: Vec<StaffBranchAggregate> = dues
        .iter()
        .filter(|d| filters.admits(&d.branch, &d.staff))
        .map(|d| StaffBranchAggregate {
            previous_due: d.amount.max(0.0),
            ..StaffBranchAggregate::empty(&d.branch, &d.staff)
        })
        .collect();
    merge_aggregates(aggregates, due_rows)
}

// ===========================================================================
// Tests
// ===========================================================================
