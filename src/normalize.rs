//! Raw sheet row → canonical draft.
//!
//! Implements the normalization rules for bookings, job cards and minor
//! sales: nested raw payload parsing, purchase type, display fields, and the
//! monetary inputs the balance calculator needs. Normalization is total; a
//! row that cannot be read becomes a flagged draft with no money on it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alias::{Field, RecordView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "booking")]
    Booking,
    #[serde(rename = "jobcard")]
    JobCard,
    #[serde(rename = "minorSale")]
    MinorSale,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Booking => "booking",
            SourceType::JobCard => "jobcard",
            SourceType::MinorSale => "minorSale",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let compact: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if compact.contains("jobcard") || compact == "jc" || compact.contains("service") {
            Some(SourceType::JobCard)
        } else if compact.contains("minor") {
            Some(SourceType::MinorSale)
        } else if compact.contains("booking") {
            Some(SourceType::Booking)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseType {
    Cash,
    Loan,
    NoHp,
    Finance,
}

impl PurchaseType {
    /// Lowercased and compacted; anything unrecognised is a cash sale.
    pub fn parse(raw: &str) -> Self {
        let compact: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match compact.as_str() {
            "loan" => PurchaseType::Loan,
            "nohp" | "nohypothecation" => PurchaseType::NoHp,
            "finance" | "financed" => PurchaseType::Finance,
            _ => PurchaseType::Cash,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseType::Cash => "cash",
            PurchaseType::Loan => "loan",
            PurchaseType::NoHp => "nohp",
            PurchaseType::Finance => "finance",
        }
    }

    /// Financed purchases track the down-payment obligation, not the price.
    pub fn is_financed(self) -> bool {
        !matches!(self, PurchaseType::Cash)
    }
}

/// Vehicle details for display. Never used in money math.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Normalized record before payments and balance are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDraft {
    pub source_type: SourceType,
    pub source_id: Option<String>,
    pub row_id: Option<String>,
    pub branch: String,
    pub staff: String,
    pub customer_name: String,
    pub customer_mobile: String,
    pub purchase_type: PurchaseType,
    pub vehicle: VehicleInfo,
    pub total_vehicle_cost: Option<f64>,
    pub on_road_price: Option<f64>,
    pub bill_total: Option<f64>,
    pub total_dp: Option<f64>,
    pub down_payment: Option<f64>,
    pub extra_fitting_amount: Option<f64>,
    pub affidavit_charges: Option<f64>,
    /// Record-level payment mode column, used by the legacy single-amount source.
    pub payment_mode: Option<String>,
    pub reference: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: Option<i64>,
    pub cash_settled: bool,
    pub online_verified: bool,
    pub malformed: bool,
    pub issues: Vec<String>,
}

impl LedgerDraft {
    /// Flagged placeholder for a row that could not be read.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            source_type: SourceType::Booking,
            source_id: None,
            row_id: None,
            branch: String::new(),
            staff: String::new(),
            customer_name: String::new(),
            customer_mobile: String::new(),
            purchase_type: PurchaseType::Cash,
            vehicle: VehicleInfo::default(),
            total_vehicle_cost: None,
            on_road_price: None,
            bill_total: None,
            total_dp: None,
            down_payment: None,
            extra_fitting_amount: None,
            affidavit_charges: None,
            payment_mode: None,
            reference: None,
            timestamp: None,
            cash_settled: false,
            online_verified: false,
            malformed: true,
            issues: vec![reason.into()],
        }
    }
}

/// Normalize one raw row.
pub fn normalize(raw: &Value) -> LedgerDraft {
    normalize_view(&RecordView::new(raw))
}

/// Normalize a row that already has a lookup surface.
pub fn normalize_view(view: &RecordView<'_>) -> LedgerDraft {
    if !view.is_object() {
        return LedgerDraft::malformed("row is not a JSON object");
    }

    let mut issues = Vec::new();
    if let Some(err) = view.nested_error() {
        issues.push(format!("raw payload ignored: {err}"));
    }

    let source_type = resolve_source_type(view);
    let source_id = match source_type {
        SourceType::Booking => view.resolve_str(Field::BookingId),
        SourceType::JobCard => view.resolve_str(Field::JobCardNumber),
        SourceType::MinorSale => view.resolve_str(Field::MinorSaleId),
    }
    .or_else(|| view.resolve_str(Field::BookingId))
    .or_else(|| view.resolve_str(Field::JobCardNumber))
    .or_else(|| view.resolve_str(Field::MinorSaleId));

    let purchase_type = view
        .resolve_str(Field::PurchaseType)
        .map(|s| PurchaseType::parse(&s))
        .unwrap_or(PurchaseType::Cash);

    let vehicle = VehicleInfo {
        company: view.resolve_str(Field::Company),
        model: view.resolve_str(Field::Model),
        variant: view.resolve_str(Field::Variant),
        color: view.resolve_str(Field::Color),
    };

    let timestamp = view.resolve(Field::Timestamp).and_then(parse_timestamp);
    if timestamp.is_none() && view.resolve(Field::Timestamp).is_some() {
        issues.push("timestamp could not be parsed".to_string());
    }

    let (status_cash, status_online) = status_settlement(view);
    let cash_settled = view.resolve_flag(Field::CashSettled).unwrap_or(false) || status_cash;
    let online_verified =
        view.resolve_flag(Field::OnlineVerified).unwrap_or(false) || status_online;

    LedgerDraft {
        source_type,
        source_id,
        row_id: view.resolve_str(Field::RowId),
        branch: view.resolve_str(Field::Branch).unwrap_or_default(),
        staff: view.resolve_str(Field::Staff).unwrap_or_default(),
        customer_name: view.resolve_str(Field::CustomerName).unwrap_or_default(),
        customer_mobile: view.resolve_str(Field::CustomerMobile).unwrap_or_default(),
        purchase_type,
        vehicle,
        total_vehicle_cost: non_negative(view.resolve_money(Field::TotalVehicleCost)),
        on_road_price: non_negative(view.resolve_money(Field::OnRoadPrice)),
        bill_total: non_negative(view.resolve_money(Field::BillTotal)),
        total_dp: non_negative(view.resolve_money(Field::TotalDp)),
        down_payment: non_negative(view.resolve_money(Field::DownPayment)),
        extra_fitting_amount: non_negative(view.resolve_money(Field::ExtraFittingAmount)),
        affidavit_charges: non_negative(view.resolve_money(Field::AffidavitCharges)),
        payment_mode: view.resolve_str(Field::PaymentMode),
        reference: view.resolve_str(Field::Reference),
        timestamp,
        cash_settled,
        online_verified,
        malformed: false,
        issues,
    }
}

fn non_negative(value: Option<f64>) -> Option<f64> {
    value.map(|v| v.max(0.0))
}

fn resolve_source_type(view: &RecordView<'_>) -> SourceType {
    if let Some(explicit) = view
        .resolve_str(Field::SourceType)
        .and_then(|s| SourceType::parse(&s))
    {
        return explicit;
    }
    if view.resolve(Field::JobCardNumber).is_some() {
        SourceType::JobCard
    } else if view.resolve(Field::MinorSaleId).is_some() && view.resolve(Field::BookingId).is_none()
    {
        SourceType::MinorSale
    } else {
        SourceType::Booking
    }
}

/// Row-level status column: `(cash settled, online verified)`.
fn status_settlement(view: &RecordView<'_>) -> (bool, bool) {
    let Some(status) = view.resolve_str(Field::Status) else {
        return (false, false);
    };
    match status.trim().to_lowercase().as_str() {
        "settled" | "collected" | "verified" => (true, true),
        "cash settled" | "cash collected" => (true, false),
        "online verified" => (false, true),
        _ => (false, false),
    }
}

/// Days between the spreadsheet epoch (1899-12-30) and the Unix epoch.
const SHEET_SERIAL_UNIX_OFFSET_DAYS: f64 = 25_569.0;

/// Parse the timestamp formats the sheets produce into epoch milliseconds.
/// Naive date-times are read as UTC.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let n = n.as_f64().filter(|v| v.is_finite() && *v > 0.0)?;
            if n >= 100_000_000_000.0 {
                Some(n as i64)
            } else if n >= 100_000.0 {
                Some((n * 1000.0) as i64)
            } else {
                // Sheets serial day number
                Some(((n - SHEET_SERIAL_UNIX_OFFSET_DAYS) * 86_400_000.0).round() as i64)
            }
        }
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s
            .parse::<i64>()
            .ok()
            .and_then(|n| parse_timestamp(&Value::from(n)));
    }

    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y, %H:%M:%S",
        "%d/%m/%Y %H:%M",
        "%d-%m-%Y %H:%M:%S",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_booking_with_nested_payload() {
        let raw = json!({
            "Booking ID": "BK-1042",
            "Branch": "Hosur",
            "Executive": "Ravi",
            "Customer Name": "Anitha",
            "Mobile": "9876543210",
            "Purchase Type": "LOAN",
            "rawPayload": "{\"vehicle\":{\"company\":\"TVS\",\"model\":\"Jupiter\",\"color\":\"Grey\"},\"downPayment\":\"20,000\",\"Purchase Type\":\"cash\"}",
            "Timestamp": "2024-05-01T10:15:00Z",
        });
        let draft = normalize(&raw);
        assert_eq!(draft.source_type, SourceType::Booking);
        assert_eq!(draft.source_id.as_deref(), Some("BK-1042"));
        assert_eq!(draft.branch, "Hosur");
        assert_eq!(draft.staff, "Ravi");
        assert_eq!(draft.purchase_type, PurchaseType::Loan);
        assert_eq!(draft.vehicle.model.as_deref(), Some("Jupiter"));
        assert_eq!(draft.down_payment, Some(20000.0));
        assert!(draft.timestamp.is_some());
        assert!(!draft.malformed);
        assert!(draft.issues.is_empty());
    }

    #[test]
    fn test_unknown_purchase_type_defaults_to_cash() {
        assert_eq!(PurchaseType::parse("Exchange"), PurchaseType::Cash);
        assert_eq!(PurchaseType::parse("No HP"), PurchaseType::NoHp);
        assert_eq!(PurchaseType::parse(" Finance "), PurchaseType::Finance);
        let draft = normalize(&json!({ "Branch": "Hosur" }));
        assert_eq!(draft.purchase_type, PurchaseType::Cash);
    }

    #[test]
    fn test_source_type_inference() {
        let jc = normalize(&json!({ "Job Card No": "JC-77", "Total Amount": 1800 }));
        assert_eq!(jc.source_type, SourceType::JobCard);
        assert_eq!(jc.source_id.as_deref(), Some("JC-77"));
        assert_eq!(jc.bill_total, Some(1800.0));

        let minor = normalize(&json!({ "type": "Minor Sales", "Bill No": "MS-3" }));
        assert_eq!(minor.source_type, SourceType::MinorSale);
        assert_eq!(minor.source_id.as_deref(), Some("MS-3"));
    }

    #[test]
    fn test_malformed_rows_are_flagged_not_dropped() {
        let draft = normalize(&json!(["not", "an", "object"]));
        assert!(draft.malformed);
        assert_eq!(draft.total_vehicle_cost, None);
        assert_eq!(draft.issues.len(), 1);

        let broken_payload = normalize(&json!({ "Branch": "Hosur", "rawPayload": "{oops" }));
        assert!(!broken_payload.malformed);
        assert_eq!(broken_payload.branch, "Hosur");
        assert!(broken_payload.issues[0].starts_with("raw payload ignored"));
    }

    #[test]
    fn test_settlement_flags() {
        let draft = normalize(&json!({ "Cash Settled": true, "Status": "pending" }));
        assert!(draft.cash_settled);
        assert!(!draft.online_verified);

        let settled = normalize(&json!({ "settlementStatus": "Settled" }));
        assert!(settled.cash_settled && settled.online_verified);
    }

    #[test]
    fn test_workflow_status_does_not_settle() {
        for status in ["Closed", "cleared", "Delivered"] {
            let draft = normalize(&json!({ "Job Card No": "JC-7", "Status": status }));
            assert!(!draft.cash_settled, "{status}");
            assert!(!draft.online_verified, "{status}");
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let iso = parse_timestamp(&json!("2024-05-01T10:15:00Z")).unwrap();
        let sheet = parse_timestamp(&json!("01/05/2024 10:15:00")).unwrap();
        let plain = parse_timestamp(&json!("2024-05-01 10:15:00")).unwrap();
        assert_eq!(iso, sheet);
        assert_eq!(iso, plain);
        assert_eq!(parse_timestamp(&json!(1714558500000i64)), Some(1714558500000));
        assert_eq!(parse_timestamp(&json!(1714558500)), Some(1714558500000));
        assert_eq!(
            parse_timestamp(&json!(45413)),
            parse_timestamp(&json!("2024-05-01"))
        );
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }
}
