//! Payment aggregation for ledger rows.
//!
//! A row can describe what was collected in several shapes: a modern
//! `payments` array, a `paymentSplit`, three numbered booking-amount slots,
//! a paired cash/online column pair, or a single legacy amount + mode. Only
//! the first shape that yields a usable payment is read; shapes are never
//! summed together, since the same money is often written to both a modern
//! array and the legacy columns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alias::{Field, RecordView};
use crate::money::round_money;
use crate::normalize::LedgerDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    Cash,
    Online,
}

impl PaymentMode {
    /// Anything mentioning cash, or nothing at all, is cash. UPI, card,
    /// NEFT, cheque and the rest are online.
    pub fn parse(raw: Option<&str>) -> Self {
        let lower = raw.map(|s| s.trim().to_lowercase()).unwrap_or_default();
        if lower.is_empty() || lower.contains("cash") {
            PaymentMode::Cash
        } else {
            PaymentMode::Online
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMode::Cash => "cash",
            PaymentMode::Online => "online",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub amount: f64,
    pub mode: PaymentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<u8>,
}

/// Which shape of the row the payments were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentSource {
    PaymentsArray,
    PaymentSplit,
    Slots,
    PairedColumns,
    Legacy,
    None,
}

/// Channel totals for one row. `total` is always `cash + online`.
#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub cash: f64,
    pub online: f64,
    pub total: f64,
    pub source: PaymentSource,
    pub records: Vec<PaymentRecord>,
}

impl Collected {
    pub fn empty() -> Self {
        Self::from_records(PaymentSource::None, Vec::new())
    }

    fn from_records(source: PaymentSource, records: Vec<PaymentRecord>) -> Self {
        let mut cash = 0.0;
        let mut online = 0.0;
        for record in &records {
            match record.mode {
                PaymentMode::Cash => cash += record.amount,
                PaymentMode::Online => online += record.amount,
            }
        }
        let cash = round_money(cash);
        let online = round_money(online);
        Self {
            cash,
            online,
            total: round_money(cash + online),
            source,
            records,
        }
    }

    /// `cash`, `online`, `both`, or empty when nothing was collected.
    pub fn mode_label(&self) -> &'static str {
        match (self.cash > 0.0, self.online > 0.0) {
            (true, true) => "both",
            (true, false) => "cash",
            (false, true) => "online",
            (false, false) => "",
        }
    }

    pub fn first_reference(&self) -> Option<&str> {
        self.records.iter().find_map(|r| r.reference.as_deref())
    }
}

/// Aggregate one raw row. The draft supplies the record-level payment mode
/// and reference for the legacy single-amount shape.
pub fn aggregate(raw: &Value, draft: &LedgerDraft) -> Collected {
    aggregate_view(&RecordView::new(raw), draft)
}

pub fn aggregate_view(view: &RecordView<'_>, draft: &LedgerDraft) -> Collected {
    if draft.malformed {
        return Collected::empty();
    }
    let (source, records) = collect_payments(view, draft);
    Collected::from_records(source, records)
}

/// Payments from the first shape that yields any positive amount.
pub fn collect_payments(
    view: &RecordView<'_>,
    draft: &LedgerDraft,
) -> (PaymentSource, Vec<PaymentRecord>) {
    let attempts: [(PaymentSource, Vec<PaymentRecord>); 5] = [
        (PaymentSource::PaymentsArray, from_payments_array(view)),
        (PaymentSource::PaymentSplit, from_payment_split(view)),
        (PaymentSource::Slots, from_slots(view, draft)),
        (PaymentSource::PairedColumns, from_paired_columns(view, draft)),
        (PaymentSource::Legacy, from_legacy(view, draft)),
    ];
    for (source, records) in attempts {
        if !records.is_empty() {
            return (source, records);
        }
    }
    (PaymentSource::None, Vec::new())
}

fn positive(amount: Option<f64>) -> Option<f64> {
    amount.filter(|a| *a > 0.0)
}

fn record_from_entry(entry: &Value) -> Option<PaymentRecord> {
    let view = RecordView::new(entry);
    let amount = positive(view.resolve_money(Field::BookingAmount))?;
    let part = view
        .resolve_money(Field::PaymentPart)
        .map(|p| p as u8)
        .filter(|p| (1..=3).contains(p));
    Some(PaymentRecord {
        amount,
        mode: PaymentMode::parse(view.resolve_str(Field::PaymentMode).as_deref()),
        reference: view.resolve_str(Field::Reference),
        part,
    })
}

fn from_payments_array(view: &RecordView<'_>) -> Vec<PaymentRecord> {
    view.resolve_array(Field::Payments)
        .unwrap_or_default()
        .iter()
        .filter_map(record_from_entry)
        .collect()
}

/// `paymentSplit` is either a list of `{amount, mode}` entries, or one or
/// more `{cash, online}` objects.
fn from_payment_split(view: &RecordView<'_>) -> Vec<PaymentRecord> {
    let entries = match view.resolve(Field::PaymentSplit) {
        Some(obj @ Value::Object(_)) => vec![obj.clone()],
        Some(_) => view.resolve_array(Field::PaymentSplit).unwrap_or_default(),
        None => Vec::new(),
    };

    let mut records = Vec::new();
    for entry in &entries {
        if let Some(record) = record_from_entry(entry) {
            records.push(record);
            continue;
        }
        let pair = RecordView::new(entry);
        let reference = pair.resolve_str(Field::Reference);
        if let Some(cash) = positive(pair.resolve_money(Field::SplitCash)) {
            records.push(PaymentRecord {
                amount: cash,
                mode: PaymentMode::Cash,
                reference: None,
                part: None,
            });
        }
        if let Some(online) = positive(pair.resolve_money(Field::SplitOnline)) {
            records.push(PaymentRecord {
                amount: online,
                mode: PaymentMode::Online,
                reference: reference.clone(),
                part: None,
            });
        }
    }
    records
}

fn from_slots(view: &RecordView<'_>, draft: &LedgerDraft) -> Vec<PaymentRecord> {
    let mut records = Vec::new();
    for part in 1..=3u8 {
        if let Some(cash) = positive(view.resolve_money(Field::SlotCash(part))) {
            records.push(PaymentRecord {
                amount: cash,
                mode: PaymentMode::Cash,
                reference: None,
                part: Some(part),
            });
        }
        if let Some(online) = positive(view.resolve_money(Field::SlotOnline(part))) {
            records.push(PaymentRecord {
                amount: online,
                mode: PaymentMode::Online,
                reference: draft.reference.clone(),
                part: Some(part),
            });
        }
    }
    records
}

fn from_paired_columns(view: &RecordView<'_>, draft: &LedgerDraft) -> Vec<PaymentRecord> {
    let mut records = Vec::new();
    if let Some(cash) = positive(view.resolve_money(Field::CashAmount)) {
        records.push(PaymentRecord {
            amount: cash,
            mode: PaymentMode::Cash,
            reference: None,
            part: None,
        });
    }
    if let Some(online) = positive(view.resolve_money(Field::OnlineAmount)) {
        records.push(PaymentRecord {
            amount: online,
            mode: PaymentMode::Online,
            reference: draft.reference.clone(),
            part: None,
        });
    }
    records
}

fn from_legacy(view: &RecordView<'_>, draft: &LedgerDraft) -> Vec<PaymentRecord> {
    positive(view.resolve_money(Field::BookingAmount))
        .map(|amount| PaymentRecord {
            amount,
            mode: PaymentMode::parse(draft.payment_mode.as_deref()),
            reference: draft.reference.clone(),
            part: None,
        })
        .into_iter()
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use serde_json::json;

    fn collected(raw: &Value) -> Collected {
        aggregate(raw, &normalize(raw))
    }

    #[test]
    fn test_payments_array_sums_by_mode() {
        let raw = json!({
            "payments": [
                { "amount": 10000, "mode": "cash" },
                { "amount": "5,000", "mode": "UPI", "reference": "UTR123" },
                { "amount": 0, "mode": "cash" },
                { "amount": -50, "mode": "online" },
            ]
        });
        let c = collected(&raw);
        assert_eq!(c.source, PaymentSource::PaymentsArray);
        assert_eq!(c.cash, 10000.0);
        assert_eq!(c.online, 5000.0);
        assert_eq!(c.total, 15000.0);
        assert_eq!(c.first_reference(), Some("UTR123"));
        assert_eq!(c.mode_label(), "both");
    }

    #[test]
    fn test_modern_array_wins_over_legacy_fields() {
        // Same money written twice; counting both would double it.
        let raw = json!({
            "Booking Amount": 5000,
            "Payment Mode": "Cash",
            "rawPayload": "{\"payments\":[{\"amount\":5000,\"mode\":\"cash\"}]}",
        });
        let c = collected(&raw);
        assert_eq!(c.source, PaymentSource::PaymentsArray);
        assert_eq!(c.total, 5000.0);
    }

    #[test]
    fn test_payment_split_pairs() {
        let raw = json!({ "paymentSplit": { "cash": "3,000", "online": 2000, "utr": "U1" } });
        let c = collected(&raw);
        assert_eq!(c.source, PaymentSource::PaymentSplit);
        assert_eq!((c.cash, c.online), (3000.0, 2000.0));
        assert_eq!(c.records[1].reference.as_deref(), Some("U1"));
    }

    #[test]
    fn test_numbered_slots() {
        let raw = json!({
            "bookingAmount1Cash": 2000,
            "bookingAmount1Online": "",
            "Booking Amount 2 Online": "1,500",
            "bookingAmount3Cash": 0,
        });
        let c = collected(&raw);
        assert_eq!(c.source, PaymentSource::Slots);
        assert_eq!(c.cash, 2000.0);
        assert_eq!(c.online, 1500.0);
        assert_eq!(c.records[1].part, Some(2));
    }

    #[test]
    fn test_paired_columns_for_job_cards() {
        let raw = json!({ "Job Card No": "JC-1", "Cash Amount": 800, "Online Amount": 400 });
        let c = collected(&raw);
        assert_eq!(c.source, PaymentSource::PairedColumns);
        assert_eq!(c.total, 1200.0);
    }

    #[test]
    fn test_legacy_single_amount() {
        let raw = json!({ "Booking Amount": "₹4,000", "Payment Mode": "Google Pay" });
        let c = collected(&raw);
        assert_eq!(c.source, PaymentSource::Legacy);
        assert_eq!(c.online, 4000.0);
        assert_eq!(c.cash, 0.0);
    }

    #[test]
    fn test_nothing_collected() {
        let c = collected(&json!({ "Booking Amount": 0, "payments": [] }));
        assert_eq!(c.source, PaymentSource::None);
        assert_eq!(c.total, 0.0);
        assert_eq!(c.mode_label(), "");
    }

    #[test]
    fn test_total_is_sum_of_channels() {
        let raw = json!({
            "payments": [
                { "amount": 0.1, "mode": "cash" },
                { "amount": 0.2, "mode": "cash" },
                { "amount": 1234.565, "mode": "online" },
            ]
        });
        let c = collected(&raw);
        assert_eq!(c.total, round_money(c.cash + c.online));
    }

    #[test]
    fn test_payment_mode_parse() {
        assert_eq!(PaymentMode::parse(None), PaymentMode::Cash);
        assert_eq!(PaymentMode::parse(Some("CASH")), PaymentMode::Cash);
        assert_eq!(PaymentMode::parse(Some("neft")), PaymentMode::Online);
    }
}
