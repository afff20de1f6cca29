//! Outstanding balance for one ledger row.
//!
//! Financed purchases (loan, no-HP, finance) owe their down payment; cash
//! purchases owe the vehicle cost. Job cards and minor sales fall through to
//! their bill total. When no obligation can be resolved the result is `None`,
//! never zero: an unknown balance must be reviewed, not shown as paid.

use serde::{Deserialize, Serialize};

use crate::money::round_money;
use crate::normalize::LedgerDraft;
use crate::payments::Collected;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceLabel {
    #[serde(rename = "Balance Amount")]
    BalanceAmount,
    #[serde(rename = "Balanced DP")]
    BalancedDp,
}

impl BalanceLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            BalanceLabel::BalanceAmount => "Balance Amount",
            BalanceLabel::BalancedDp => "Balanced DP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub total_due: f64,
    pub balance_value: f64,
    pub label: BalanceLabel,
}

/// Label a row would carry regardless of whether its total resolves.
pub fn label_for(draft: &LedgerDraft) -> BalanceLabel {
    if draft.purchase_type.is_financed() {
        BalanceLabel::BalancedDp
    } else {
        BalanceLabel::BalanceAmount
    }
}

fn explicit(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

/// Base term plus fitting and affidavit extras. Extras alone are not an
/// obligation.
fn from_parts(base: Option<f64>, draft: &LedgerDraft) -> Option<f64> {
    let base = explicit(base)?;
    let extras =
        draft.extra_fitting_amount.unwrap_or(0.0) + draft.affidavit_charges.unwrap_or(0.0);
    Some(round_money(base + extras))
}

/// Resolve the obligation through its fallback chain.
pub fn total_due(draft: &LedgerDraft) -> Option<(f64, BalanceLabel)> {
    if draft.malformed {
        return None;
    }
    let label = label_for(draft);
    let due = match label {
        BalanceLabel::BalancedDp => {
            explicit(draft.total_dp).or_else(|| from_parts(draft.down_payment, draft))
        }
        BalanceLabel::BalanceAmount => explicit(draft.total_vehicle_cost)
            .or_else(|| from_parts(draft.on_road_price, draft))
            .or_else(|| explicit(draft.bill_total)),
    }?;
    Some((round_money(due), label))
}

pub fn compute_balance(draft: &LedgerDraft, collected: &Collected) -> Option<Balance> {
    let (due, label) = total_due(draft)?;
    Some(Balance {
        total_due: due,
        balance_value: round_money((due - collected.total).max(0.0)),
        label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::payments::aggregate;
    use serde_json::{json, Value};

    fn balance_of(raw: &Value) -> Option<Balance> {
        let draft = normalize(raw);
        let collected = aggregate(raw, &draft);
        compute_balance(&draft, &collected)
    }

    #[test]
    fn test_cash_sale_balance() {
        let raw = json!({
            "Purchase Type": "Cash",
            "Total Vehicle Cost": "1,20,000",
            "payments": [{ "amount": 50000, "mode": "cash" }],
        });
        let b = balance_of(&raw).unwrap();
        assert_eq!(b.total_due, 120000.0);
        assert_eq!(b.balance_value, 70000.0);
        assert_eq!(b.label, BalanceLabel::BalanceAmount);
    }

    #[test]
    fn test_financed_balance_from_parts() {
        let raw = json!({
            "purchaseType": "loan",
            "downPayment": 20000,
            "extraFittingAmount": 3000,
            "payments": [
                { "amount": 10000, "mode": "cash" },
                { "amount": 5000, "mode": "online" },
            ],
        });
        let draft = normalize(&raw);
        let collected = aggregate(&raw, &draft);
        assert_eq!(collected.total, 15000.0);
        let b = compute_balance(&draft, &collected).unwrap();
        assert_eq!(b.total_due, 23000.0);
        assert_eq!(b.balance_value, 8000.0);
        assert_eq!(b.label, BalanceLabel::BalancedDp);
    }

    #[test]
    fn test_explicit_total_dp_preferred() {
        let raw = json!({ "Purchase Type": "finance", "Total DP": 25000, "Down Payment": 20000 });
        assert_eq!(balance_of(&raw).unwrap().total_due, 25000.0);
    }

    #[test]
    fn test_zero_explicit_total_falls_through() {
        let raw = json!({ "totalVehicleCost": 0, "onRoadPrice": 95000, "affidavitCharges": 500 });
        assert_eq!(balance_of(&raw).unwrap().total_due, 95500.0);
    }

    #[test]
    fn test_unknown_obligation_is_none() {
        let raw = json!({
            "Booking ID": "BK-9",
            "extraFittingAmount": 2000,
            "payments": [{ "amount": 1000, "mode": "cash" }],
        });
        assert!(balance_of(&raw).is_none());
        let financed = json!({ "Purchase Type": "nohp", "Total Vehicle Cost": 90000 });
        assert!(balance_of(&financed).is_none());
    }

    #[test]
    fn test_overpayment_clamps_to_zero() {
        let raw = json!({
            "Total Vehicle Cost": 1000,
            "payments": [{ "amount": 1500, "mode": "online" }],
        });
        assert_eq!(balance_of(&raw).unwrap().balance_value, 0.0);
    }

    #[test]
    fn test_job_card_uses_bill_total() {
        let raw = json!({ "Job Card No": "JC-4", "Total Amount": 1800, "Cash Amount": 800 });
        let b = balance_of(&raw).unwrap();
        assert_eq!(b.balance_value, 1000.0);
    }
}
