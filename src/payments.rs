// Payment recorder: the only writer of candidate financial totals.
//
// Every recording is one database transaction covering the payment insert
// and the totals update; callers can never observe one without the other.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::db::{
    self, Candidate, Ledger, Payment, PaymentMethod, PaymentType,
};
use crate::error::{LedgerError, Result};

/// Input for one funds-received event
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub candidate_id: i64,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Payment joined with the owning candidate's contact details, for receipts
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    #[serde(flatten)]
    pub payment: Payment,
    pub candidate_name: String,
    pub candidate_phone: Option<String>,
    pub candidate_email: Option<String>,
}

/// Record a payment on behalf of `principal`.
///
/// Validation and the ownership check happen before any mutation; the
/// insert and the totals rewrite then commit as one unit. A negative
/// resulting due amount (overpayment) is accepted.
pub fn record_payment(ledger: &Ledger, principal: &Principal, payment: &NewPayment) -> Result<i64> {
    validate_amount(payment.amount)?;
    principal.ensure_may_record_payments()?;

    ledger.with_transaction(|tx| {
        let candidate = db::get_candidate(tx, payment.candidate_id)?
            .ok_or_else(|| LedgerError::NotFound("Candidate not found".to_string()))?;
        principal.ensure_may_access(&candidate)?;

        record_payment_tx(tx, &candidate, payment)
    })
}

/// The recording unit itself, composable into a larger open transaction
/// (the callback reconciler runs it together with its status transition).
/// `candidate` must be the in-transaction snapshot of the candidate row.
pub fn record_payment_tx(
    conn: &Connection,
    candidate: &Candidate,
    payment: &NewPayment,
) -> Result<i64> {
    validate_amount(payment.amount)?;

    conn.execute(
        "INSERT INTO payments (
            candidate_id, amount, payment_type, payment_method,
            transaction_id, notes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            candidate.id,
            payment.amount.to_string(),
            payment.payment_type.as_str(),
            payment.payment_method.as_str(),
            payment.transaction_id,
            payment.notes,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(LedgerError::from)?;

    let payment_id = conn.last_insert_rowid();

    let new_total_paid = candidate.total_paid + payment.amount;
    let new_due = candidate.package_amount - new_total_paid;

    conn.execute(
        "UPDATE candidates SET total_paid = ?1, due_amount = ?2 WHERE id = ?3",
        params![new_total_paid.to_string(), new_due.to_string(), candidate.id],
    )
    .map_err(LedgerError::from)?;

    tracing::info!(
        candidate_id = candidate.id,
        payment_id,
        amount = %payment.amount,
        method = payment.payment_method.as_str(),
        total_paid = %new_total_paid,
        due = %new_due,
        "payment recorded"
    );

    Ok(payment_id)
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::Validation(
            "Payment amount must be a positive number".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// READS
// ============================================================================

fn map_payment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    let payment_type: String = row.get(3)?;
    let payment_method: String = row.get(4)?;
    Ok(Payment {
        id: row.get(0)?,
        candidate_id: row.get(1)?,
        amount: db::decimal_column(row.get(2)?)?,
        payment_type: PaymentType::from_str(&payment_type).ok_or(rusqlite::Error::InvalidQuery)?,
        payment_method: PaymentMethod::from_str(&payment_method)
            .ok_or(rusqlite::Error::InvalidQuery)?,
        transaction_id: row.get(5)?,
        notes: row.get(6)?,
        created_at: db::timestamp_column(row.get(7)?)?,
    })
}

/// Payment history for one candidate, newest first.
pub fn payments_for_candidate(
    ledger: &Ledger,
    principal: &Principal,
    candidate_id: i64,
) -> Result<Vec<Payment>> {
    ledger.with_connection(|conn| {
        let candidate = db::get_candidate(conn, candidate_id)?
            .ok_or_else(|| LedgerError::NotFound("Candidate not found".to_string()))?;
        principal.ensure_may_access(&candidate)?;

        let mut stmt = conn
            .prepare(
                "SELECT id, candidate_id, amount, payment_type, payment_method,
                        transaction_id, notes, created_at
                 FROM payments
                 WHERE candidate_id = ?1
                 ORDER BY created_at DESC, id DESC",
            )
            .map_err(LedgerError::from)?;

        let payments = stmt
            .query_map(params![candidate_id], map_payment_row)
            .map_err(LedgerError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(LedgerError::from)?;

        Ok(payments)
    })
}

/// Receipt lookup by gateway correlation token.
pub fn payment_by_transaction(
    ledger: &Ledger,
    principal: &Principal,
    tran_id: &str,
) -> Result<PaymentReceipt> {
    ledger.with_connection(|conn| {
        let receipt = conn
            .query_row(
                "SELECT p.id, p.candidate_id, p.amount, p.payment_type, p.payment_method,
                        p.transaction_id, p.notes, p.created_at,
                        c.name, c.phone, c.email, c.agent_id
                 FROM payments p
                 JOIN candidates c ON p.candidate_id = c.id
                 WHERE p.transaction_id = ?1",
                params![tran_id],
                |row| {
                    let payment = map_payment_row(row)?;
                    let agent_id: i64 = row.get(11)?;
                    Ok((
                        PaymentReceipt {
                            payment,
                            candidate_name: row.get(8)?,
                            candidate_phone: row.get(9)?,
                            candidate_email: row.get(10)?,
                        },
                        agent_id,
                    ))
                },
            )
            .optional()
            .map_err(LedgerError::from)?;

        let (receipt, agent_id) = receipt.ok_or_else(|| {
            LedgerError::NotFound("Payment record not found in database".to_string())
        })?;

        if matches!(principal.role, crate::auth::Role::Agent) && agent_id != principal.id {
            return Err(LedgerError::Forbidden(
                "You do not have permission to access this receipt".to_string(),
            ));
        }

        Ok(receipt)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::db::NewCandidate;
    use rust_decimal_macros::dec;

    fn seed_candidate(ledger: &Ledger, agent_id: i64, package: Decimal) -> i64 {
        ledger
            .with_connection(|conn| {
                db::insert_candidate(
                    conn,
                    &NewCandidate {
                        agent_id,
                        name: "Rahim Uddin".to_string(),
                        passport_number: format!("P{agent_id}-{package}"),
                        phone: Some("01811000111".to_string()),
                        email: Some("rahim@example.com".to_string()),
                        package_amount: package,
                        status: "processing".to_string(),
                    },
                )
            })
            .unwrap()
    }

    fn cash_payment(candidate_id: i64, amount: Decimal) -> NewPayment {
        NewPayment {
            candidate_id,
            amount,
            payment_type: PaymentType::Service,
            payment_method: PaymentMethod::Cash,
            transaction_id: None,
            notes: Some("Initial booking".to_string()),
        }
    }

    #[test]
    fn test_cash_payment_updates_totals() {
        let ledger = Ledger::open_in_memory().unwrap();
        let admin = Principal::new(1, Role::Admin);
        let id = seed_candidate(&ledger, 3, dec!(450000));

        record_payment(&ledger, &admin, &cash_payment(id, dec!(50000))).unwrap();

        let candidate = ledger
            .with_connection(|conn| db::get_candidate(conn, id))
            .unwrap()
            .unwrap();
        assert_eq!(candidate.total_paid, dec!(50000));
        assert_eq!(candidate.due_amount, dec!(400000));

        let payments = payments_for_candidate(&ledger, &admin, id).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, dec!(50000));
        assert_eq!(payments[0].payment_method, PaymentMethod::Cash);
    }

    #[test]
    fn test_totals_match_payment_history_after_sequence() {
        let ledger = Ledger::open_in_memory().unwrap();
        let admin = Principal::new(1, Role::SuperAdmin);
        let id = seed_candidate(&ledger, 3, dec!(450000));

        for amount in [dec!(50000), dec!(125000.50), dec!(4999.50)] {
            record_payment(&ledger, &admin, &cash_payment(id, amount)).unwrap();
        }

        let candidate = ledger
            .with_connection(|conn| db::get_candidate(conn, id))
            .unwrap()
            .unwrap();
        assert_eq!(candidate.total_paid, dec!(180000));
        assert_eq!(candidate.due_amount, dec!(270000));

        // Stored totals agree with the payment rows themselves
        let drift = ledger.with_connection(db::totals_drift).unwrap();
        assert!(drift.is_empty());
    }

    #[test]
    fn test_overpayment_goes_negative_without_error() {
        let ledger = Ledger::open_in_memory().unwrap();
        let admin = Principal::new(1, Role::Admin);
        let id = seed_candidate(&ledger, 3, dec!(1000));

        record_payment(&ledger, &admin, &cash_payment(id, dec!(1500))).unwrap();

        let candidate = ledger
            .with_connection(|conn| db::get_candidate(conn, id))
            .unwrap()
            .unwrap();
        assert_eq!(candidate.due_amount, dec!(-500));
    }

    #[test]
    fn test_non_positive_amount_rejected_before_any_write() {
        let ledger = Ledger::open_in_memory().unwrap();
        let admin = Principal::new(1, Role::Admin);
        let id = seed_candidate(&ledger, 3, dec!(1000));

        for amount in [Decimal::ZERO, dec!(-25)] {
            let result = record_payment(&ledger, &admin, &cash_payment(id, amount));
            assert!(matches!(result, Err(LedgerError::Validation(_))));
        }

        let payments = payments_for_candidate(&ledger, &admin, id).unwrap();
        assert!(payments.is_empty());
    }

    #[test]
    fn test_missing_candidate_is_not_found() {
        let ledger = Ledger::open_in_memory().unwrap();
        let admin = Principal::new(1, Role::Admin);

        let result = record_payment(&ledger, &admin, &cash_payment(999, dec!(100)));
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_agent_cannot_pay_for_foreign_candidate() {
        let ledger = Ledger::open_in_memory().unwrap();
        let id = seed_candidate(&ledger, 3, dec!(1000));

        let other_agent = Principal::new(4, Role::Agent);
        let result = record_payment(&ledger, &other_agent, &cash_payment(id, dec!(100)));
        assert!(matches!(result, Err(LedgerError::Forbidden(_))));

        // Rejected before mutation: no payment row, totals untouched
        let admin = Principal::new(1, Role::Admin);
        assert!(payments_for_candidate(&ledger, &admin, id).unwrap().is_empty());
        let candidate = ledger
            .with_connection(|conn| db::get_candidate(conn, id))
            .unwrap()
            .unwrap();
        assert_eq!(candidate.total_paid, Decimal::ZERO);
    }

    #[test]
    fn test_owning_agent_may_record() {
        let ledger = Ledger::open_in_memory().unwrap();
        let id = seed_candidate(&ledger, 3, dec!(1000));

        let owner = Principal::new(3, Role::Agent);
        record_payment(&ledger, &owner, &cash_payment(id, dec!(100))).unwrap();
    }

    #[test]
    fn test_data_entry_cannot_record() {
        let ledger = Ledger::open_in_memory().unwrap();
        let id = seed_candidate(&ledger, 3, dec!(1000));

        let clerk = Principal::new(5, Role::DataEntry);
        let result = record_payment(&ledger, &clerk, &cash_payment(id, dec!(100)));
        assert!(matches!(result, Err(LedgerError::Forbidden(_))));
    }

    #[test]
    fn test_receipt_lookup_by_transaction() {
        let ledger = Ledger::open_in_memory().unwrap();
        let admin = Principal::new(1, Role::Admin);
        let id = seed_candidate(&ledger, 3, dec!(1000));

        let mut payment = cash_payment(id, dec!(250));
        payment.payment_method = PaymentMethod::Gateway;
        payment.transaction_id = Some("GW-RECEIPT1".to_string());
        record_payment(&ledger, &admin, &payment).unwrap();

        let receipt = payment_by_transaction(&ledger, &admin, "GW-RECEIPT1").unwrap();
        assert_eq!(receipt.payment.amount, dec!(250));
        assert_eq!(receipt.candidate_name, "Rahim Uddin");

        // Unknown token
        let missing = payment_by_transaction(&ledger, &admin, "GW-NOPE");
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));

        // Foreign agent is refused the receipt
        let other_agent = Principal::new(4, Role::Agent);
        let refused = payment_by_transaction(&ledger, &other_agent, "GW-RECEIPT1");
        assert!(matches!(refused, Err(LedgerError::Forbidden(_))));
    }
}
