//! Field alias table and record lookup surface.
//!
//! Sheet rows spell the same column many ways (`"Booking Amount"`,
//! `bookingAmount`, `Booking_Amount`) and the richer form payload nests some
//! of them (`vehicle.model`). Every lookup in the engine names a [`Field`];
//! the spellings for that field live in [`Field::aliases`] and nowhere else.

use serde_json::{Map, Value};

use crate::money;

/// Canonical field names the engine reads from raw records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    RowId,
    SourceType,
    BookingId,
    JobCardNumber,
    MinorSaleId,
    Branch,
    Staff,
    CustomerName,
    CustomerMobile,
    PurchaseType,
    Company,
    Model,
    Variant,
    Color,
    TotalVehicleCost,
    OnRoadPrice,
    BillTotal,
    TotalDp,
    DownPayment,
    ExtraFittingAmount,
    AffidavitCharges,
    Payments,
    PaymentSplit,
    SlotCash(u8),
    SlotOnline(u8),
    SplitCash,
    SplitOnline,
    PaymentPart,
    CashAmount,
    OnlineAmount,
    BookingAmount,
    PaymentMode,
    Reference,
    Timestamp,
    CashSettled,
    OnlineVerified,
    Status,
    PreviousDue,
    RawPayload,
}

impl Field {
    /// Known spellings, most specific first. Dotted entries address nested
    /// objects (`vehicle.model`).
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::RowId => &[
                "id", "ID", "Id", "rowId", "Row ID", "ledgerId", "Ledger ID", "txnId", "Txn ID",
            ],
            Field::SourceType => &[
                "sourceType",
                "Source Type",
                "source_type",
                "entryType",
                "Entry Type",
                "type",
                "Type",
            ],
            Field::BookingId => &[
                "bookingId",
                "Booking ID",
                "Booking Id",
                "booking_id",
                "BookingID",
                "bookingNo",
                "Booking No",
            ],
            Field::JobCardNumber => &[
                "jobCardNumber",
                "Job Card Number",
                "Job Card No",
                "jobCardNo",
                "job_card_number",
                "jcNumber",
                "JC No",
            ],
            Field::MinorSaleId => &[
                "minorSaleId",
                "saleId",
                "Sale ID",
                "invoiceNo",
                "Invoice No",
                "billNo",
                "Bill No",
            ],
            Field::Branch => &[
                "branch",
                "Branch",
                "branchName",
                "Branch Name",
                "branch_name",
                "location",
                "Location",
            ],
            Field::Staff => &[
                "staff",
                "Staff",
                "staffName",
                "Staff Name",
                "executive",
                "Executive",
                "Executive Name",
                "salesExecutive",
                "Sales Executive",
                "createdBy",
                "Created By",
            ],
            Field::CustomerName => &[
                "customerName",
                "Customer Name",
                "customer_name",
                "customer.name",
                "name",
                "Name",
            ],
            Field::CustomerMobile => &[
                "customerMobile",
                "Customer Mobile",
                "customer_mobile",
                "customer.mobile",
                "customer.phone",
                "mobile",
                "Mobile",
                "Mobile Number",
                "mobileNumber",
                "phone",
                "Phone",
            ],
            Field::PurchaseType => &[
                "purchaseType",
                "Purchase Type",
                "purchase_type",
                "paymentType",
                "Payment Type",
                "saleType",
                "Sale Type",
            ],
            Field::Company => &["company", "Company", "vehicle.company", "make", "Make"],
            Field::Model => &[
                "model",
                "Model",
                "vehicle.model",
                "vehicleModel",
                "Vehicle Model",
            ],
            Field::Variant => &["variant", "Variant", "vehicle.variant"],
            Field::Color => &[
                "color",
                "Color",
                "colour",
                "Colour",
                "vehicle.color",
                "vehicle.colour",
            ],
            Field::TotalVehicleCost => &[
                "totalVehicleCost",
                "Total Vehicle Cost",
                "total_vehicle_cost",
                "vehicle.totalVehicleCost",
                "totalCost",
                "Total Cost",
            ],
            Field::OnRoadPrice => &[
                "onRoadPrice",
                "On Road Price",
                "on_road_price",
                "onroadPrice",
                "vehicle.onRoadPrice",
                "price.onRoad",
            ],
            Field::BillTotal => &[
                "totalAmount",
                "Total Amount",
                "grandTotal",
                "Grand Total",
                "billAmount",
                "Bill Amount",
            ],
            Field::TotalDp => &[
                "totalDp",
                "totalDP",
                "Total DP",
                "total_dp",
                "Total Down Payment",
                "finance.totalDp",
            ],
            Field::DownPayment => &[
                "downPayment",
                "Down Payment",
                "down_payment",
                "dp",
                "DP",
                "finance.downPayment",
            ],
            Field::ExtraFittingAmount => &[
                "extraFittingAmount",
                "Extra Fitting Amount",
                "extra_fitting_amount",
                "extraFitting",
                "Extra Fitting",
                "accessoriesAmount",
                "finance.extraFittingAmount",
            ],
            Field::AffidavitCharges => &[
                "affidavitCharges",
                "Affidavit Charges",
                "affidavit_charges",
                "affidavit",
                "Affidavit",
                "finance.affidavitCharges",
            ],
            Field::Payments => &["payments", "Payments", "paymentList", "payment_list"],
            Field::PaymentSplit => &["paymentSplit", "Payment Split", "payment_split"],
            Field::SlotCash(1) => &[
                "bookingAmount1Cash",
                "Booking Amount 1 Cash",
                "booking_amount_1_cash",
                "part1Cash",
            ],
            Field::SlotCash(2) => &[
                "bookingAmount2Cash",
                "Booking Amount 2 Cash",
                "booking_amount_2_cash",
                "part2Cash",
            ],
            Field::SlotCash(3) => &[
                "bookingAmount3Cash",
                "Booking Amount 3 Cash",
                "booking_amount_3_cash",
                "part3Cash",
            ],
            Field::SlotOnline(1) => &[
                "bookingAmount1Online",
                "Booking Amount 1 Online",
                "booking_amount_1_online",
                "part1Online",
            ],
            Field::SlotOnline(2) => &[
                "bookingAmount2Online",
                "Booking Amount 2 Online",
                "booking_amount_2_online",
                "part2Online",
            ],
            Field::SlotOnline(3) => &[
                "bookingAmount3Online",
                "Booking Amount 3 Online",
                "booking_amount_3_online",
                "part3Online",
            ],
            Field::SlotCash(_) | Field::SlotOnline(_) => &[],
            Field::SplitCash => &["cash", "Cash", "cashAmount", "Cash Amount"],
            Field::SplitOnline => &["online", "Online", "onlineAmount", "Online Amount"],
            Field::PaymentPart => &["part", "Part", "installment", "Installment", "slot"],
            Field::CashAmount => &[
                "cashAmount",
                "Cash Amount",
                "cash_amount",
                "cashCollected",
                "Cash Collected",
            ],
            Field::OnlineAmount => &[
                "onlineAmount",
                "Online Amount",
                "online_amount",
                "onlineCollected",
                "Online Collected",
            ],
            Field::BookingAmount => &[
                "bookingAmount",
                "Booking Amount",
                "Booking_Amount",
                "booking_amount",
                "amount",
                "Amount",
            ],
            Field::PaymentMode => &[
                "paymentMode",
                "Payment Mode",
                "payment_mode",
                "paymentMethod",
                "Payment Method",
                "mode",
                "Mode",
            ],
            Field::Reference => &[
                "reference",
                "Reference",
                "referenceNo",
                "Reference No",
                "utr",
                "UTR",
                "transactionId",
                "Transaction ID",
            ],
            Field::Timestamp => &[
                "timestamp",
                "Timestamp",
                "savedAt",
                "Saved At",
                "updatedAt",
                "Updated At",
                "createdAt",
                "Created At",
                "created_at",
                "date",
                "Date",
            ],
            Field::CashSettled => &[
                "cashSettled",
                "Cash Settled",
                "cash_settled",
                "cashCollectedAt",
            ],
            Field::OnlineVerified => &[
                "onlineVerified",
                "Online Verified",
                "online_verified",
                "onlineSettled",
                "Online Settled",
            ],
            Field::Status => &[
                "settlementStatus",
                "Settlement Status",
                "ledgerStatus",
                "status",
                "Status",
            ],
            Field::PreviousDue => &[
                "previousDue",
                "Previous Due",
                "previous_due",
                "prevDue",
                "openingBalance",
                "Opening Balance",
                "amount",
                "Amount",
            ],
            Field::RawPayload => &[
                "rawPayload",
                "Raw Payload",
                "raw_payload",
                "RawPayload",
                "payloadJson",
            ],
        }
    }
}

/// A value counts as present unless it is null or a blank string.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn lookup<'v>(map: &'v Map<String, Value>, key: &str) -> Option<&'v Value> {
    if let Some(v) = map.get(key) {
        return Some(v);
    }
    if !key.contains('.') {
        return None;
    }
    let mut parts = key.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// One record seen through its flat columns first and its nested raw
/// payload second.
#[derive(Debug, Clone)]
pub struct RecordView<'a> {
    flat: Option<&'a Map<String, Value>>,
    nested: Option<Map<String, Value>>,
    nested_error: Option<String>,
}

impl<'a> RecordView<'a> {
    /// Build the lookup surface. A raw payload that is a JSON string is
    /// parsed; a parse failure is recorded and the payload treated as absent.
    pub fn new(raw: &'a Value) -> Self {
        let flat = raw.as_object();
        let mut nested = None;
        let mut nested_error = None;

        if let Some(map) = flat {
            for key in Field::RawPayload.aliases() {
                let Some(candidate) = map.get(*key) else {
                    continue;
                };
                match candidate {
                    Value::Object(obj) => {
                        nested = Some(obj.clone());
                        break;
                    }
                    Value::String(s) if !s.trim().is_empty() => {
                        match serde_json::from_str::<Value>(s) {
                            Ok(Value::Object(obj)) => nested = Some(obj),
                            Ok(_) => nested_error = Some(format!("{key} is not a JSON object")),
                            Err(e) => nested_error = Some(format!("{key} is not valid JSON: {e}")),
                        }
                        break;
                    }
                    _ => continue,
                }
            }
        }

        Self {
            flat,
            nested,
            nested_error,
        }
    }

    /// False when the raw row was not a JSON object at all.
    pub fn is_object(&self) -> bool {
        self.flat.is_some()
    }

    pub fn has_nested(&self) -> bool {
        self.nested.is_some()
    }

    pub fn nested_error(&self) -> Option<&str> {
        self.nested_error.as_deref()
    }

    fn layers(&self) -> [Option<&Map<String, Value>>; 2] {
        [self.flat, self.nested.as_ref()]
    }

    /// First present value for `field`, flat columns before the nested payload.
    pub fn resolve(&self, field: Field) -> Option<&Value> {
        self.resolve_where(field, is_present)
    }

    fn resolve_where(&self, field: Field, accept: impl Fn(&Value) -> bool) -> Option<&Value> {
        let aliases = field.aliases();
        for layer in self.layers().into_iter().flatten() {
            for key in aliases {
                if let Some(v) = lookup(layer, key) {
                    if accept(v) {
                        return Some(v);
                    }
                }
            }
        }
        None
    }

    /// Trimmed string form of the field. Numbers are rendered without a
    /// trailing `.0` so numeric ids and mobiles read naturally.
    pub fn resolve_str(&self, field: Field) -> Option<String> {
        self.resolve_where(field, |v| {
            matches!(v, Value::String(s) if !s.trim().is_empty()) || v.is_number()
        })
        .and_then(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => i.to_string(),
                None => n.to_string(),
            }),
            _ => None,
        })
    }

    /// First alias that coerces to a finite amount.
    pub fn resolve_money(&self, field: Field) -> Option<f64> {
        self.resolve_where(field, |v| money::to_money(v).is_some())
            .and_then(money::to_money)
    }

    /// Truthy/falsy flags as the sheet writes them (`TRUE`, `yes`, `1`, a
    /// timestamp meaning "done at").
    pub fn resolve_flag(&self, field: Field) -> Option<bool> {
        let value = self.resolve(field)?;
        if let Some(flag) = value.as_bool() {
            return Some(flag);
        }
        if let Some(n) = value.as_f64() {
            return Some(n != 0.0);
        }
        let normalized = value.as_str()?.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "true" | "1" | "yes" | "y" | "on" | "done" | "settled" | "verified" | "collected" => {
                Some(true)
            }
            "false" | "0" | "no" | "n" | "off" | "pending" | "unsettled" => Some(false),
            _ => Some(true),
        }
    }

    /// An array-valued field; sheet cells holding a JSON-encoded array are
    /// parsed.
    pub fn resolve_array(&self, field: Field) -> Option<Vec<Value>> {
        let accept = |v: &Value| match v {
            Value::Array(items) => !items.is_empty(),
            Value::String(s) => s.trim_start().starts_with('['),
            _ => false,
        };
        match self.resolve_where(field, accept)? {
            Value::Array(items) => Some(items.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Array(items)) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Resolve one field from a raw record without keeping the view around.
pub fn resolve(record: &Value, field: Field) -> Option<Value> {
    RecordView::new(record).resolve(field).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_present_alias_wins() {
        let raw = json!({
            "Booking Amount": "",
            "bookingAmount": null,
            "Booking_Amount": "5,000",
        });
        let view = RecordView::new(&raw);
        assert_eq!(view.resolve_money(Field::BookingAmount), Some(5000.0));
    }

    #[test]
    fn test_flat_takes_precedence_over_nested() {
        let raw = json!({
            "Branch": "Hosur",
            "rawPayload": "{\"branch\":\"Krishnagiri\",\"vehicle\":{\"model\":\"Jupiter\"}}",
        });
        let view = RecordView::new(&raw);
        assert!(view.has_nested());
        assert_eq!(view.resolve_str(Field::Branch).as_deref(), Some("Hosur"));
        assert_eq!(view.resolve_str(Field::Model).as_deref(), Some("Jupiter"));
    }

    #[test]
    fn test_unparseable_payload_is_absent() {
        let raw = json!({ "rawPayload": "{not json", "Staff": "Ravi" });
        let view = RecordView::new(&raw);
        assert!(!view.has_nested());
        assert!(view.nested_error().is_some());
        assert_eq!(view.resolve_str(Field::Staff).as_deref(), Some("Ravi"));
    }

    #[test]
    fn test_non_finite_money_keeps_scanning() {
        let raw = json!({ "totalDp": "pending", "Total DP": "23,000" });
        let view = RecordView::new(&raw);
        assert_eq!(view.resolve_money(Field::TotalDp), Some(23000.0));
    }

    #[test]
    fn test_numeric_strings_and_ids() {
        let raw = json!({ "Mobile": 9876543210u64, "Booking ID": 1042 });
        let view = RecordView::new(&raw);
        assert_eq!(
            view.resolve_str(Field::CustomerMobile).as_deref(),
            Some("9876543210")
        );
        assert_eq!(view.resolve_str(Field::BookingId).as_deref(), Some("1042"));
    }

    #[test]
    fn test_array_fields_accept_encoded_json() {
        let raw = json!({ "payments": "[{\"amount\":100,\"mode\":\"cash\"}]" });
        let view = RecordView::new(&raw);
        let payments = view.resolve_array(Field::Payments).unwrap();
        assert_eq!(payments.len(), 1);
    }

    #[test]
    fn test_flags() {
        let raw = json!({ "Cash Settled": "TRUE", "onlineVerified": "no" });
        let view = RecordView::new(&raw);
        assert_eq!(view.resolve_flag(Field::CashSettled), Some(true));
        assert_eq!(view.resolve_flag(Field::OnlineVerified), Some(false));
    }

    #[test]
    fn test_resolve_on_non_object_is_none() {
        assert!(resolve(&json!("just a string"), Field::Branch).is_none());
        assert!(!RecordView::new(&json!(42)).is_object());
    }
}
