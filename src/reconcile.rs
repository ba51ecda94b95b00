// Gateway callback reconciler.
//
// Converts asynchronous success/fail/cancel/IPN notifications into ledger
// updates exactly once per tran_id. Notifications arrive unauthenticated,
// possibly repeated, possibly out of order; the state machine is
//
//     pending -> { success, failed, cancelled }
//
// with every terminal state final. First writer wins: each transition is a
// conditional UPDATE guarded on `status = 'pending'`, and the affected-row
// count decides whether this delivery owns the transition. The status flip
// and the payment credit commit as one database transaction.

use rusqlite::params;

use crate::db::{self, Ledger, PaymentMethod, TransactionStatus};
use crate::error::{LedgerError, Result};
use crate::payments::{self, NewPayment};

/// The gateway asserts a checkout actually cleared with this status value;
/// anything else on a success notification is treated as a failure.
pub const VALID_SENTINEL: &str = "VALID";

/// Outcome of a success (or IPN) notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessOutcome {
    /// This delivery performed the transition and credited the payment
    Credited { candidate_id: i64 },
    /// Repeat delivery: the credit already happened, nothing re-applied
    AlreadyCredited { candidate_id: i64 },
    /// Gateway did not assert validity; no state touched
    Rejected { reason: String },
    /// No transaction with this tran_id; no state touched
    UnknownTransaction,
    /// The transaction already reached a different terminal state
    Superseded {
        status: TransactionStatus,
        candidate_id: i64,
    },
}

impl SuccessOutcome {
    /// Both first and repeat deliveries of a genuine success look the same
    /// to the paying customer.
    pub fn is_credited(&self) -> bool {
        matches!(
            self,
            SuccessOutcome::Credited { .. } | SuccessOutcome::AlreadyCredited { .. }
        )
    }
}

/// Outcome of a fail or cancel notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// This delivery performed the transition
    Marked { candidate_id: i64 },
    /// The transaction was already terminal; left untouched
    AlreadyTerminal {
        status: TransactionStatus,
        candidate_id: i64,
    },
    /// No transaction with this tran_id
    UnknownTransaction,
}

/// Handle a success notification for `tran_id`.
///
/// Idempotent: a repeat delivery returns `AlreadyCredited` without writing
/// anything. If the payment recording fails the whole unit rolls back and
/// the transaction stays `pending`, surfaced to the caller as an `Err`
/// distinct from any gateway-reported failure.
pub fn apply_success(ledger: &Ledger, tran_id: &str, gateway_status: &str) -> Result<SuccessOutcome> {
    if gateway_status != VALID_SENTINEL {
        tracing::warn!(%tran_id, %gateway_status, "success notification without valid flag");
        return Ok(SuccessOutcome::Rejected {
            reason: "Payment Validation Failed".to_string(),
        });
    }

    ledger.with_transaction(|tx| {
        let transaction = match db::get_gateway_transaction(tx, tran_id)? {
            Some(t) => t,
            None => {
                tracing::warn!(%tran_id, "success notification for unknown transaction");
                return Ok(SuccessOutcome::UnknownTransaction);
            }
        };

        match transaction.status {
            TransactionStatus::Success => {
                tracing::info!(%tran_id, "repeat success notification suppressed");
                return Ok(SuccessOutcome::AlreadyCredited {
                    candidate_id: transaction.candidate_id,
                });
            }
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                return Ok(SuccessOutcome::Superseded {
                    status: transaction.status,
                    candidate_id: transaction.candidate_id,
                });
            }
            TransactionStatus::Pending => {}
        }

        // First writer wins: only the delivery that flips the row out of
        // pending gets to credit the payment.
        let flipped = tx
            .execute(
                "UPDATE gateway_transactions SET status = 'success'
                 WHERE tran_id = ?1 AND status = 'pending'",
                params![tran_id],
            )
            .map_err(LedgerError::from)?;

        if flipped == 0 {
            let current = db::get_gateway_transaction(tx, tran_id)?.map(|t| t.status);
            return Ok(match current {
                Some(TransactionStatus::Success) => SuccessOutcome::AlreadyCredited {
                    candidate_id: transaction.candidate_id,
                },
                Some(status) => SuccessOutcome::Superseded {
                    status,
                    candidate_id: transaction.candidate_id,
                },
                None => SuccessOutcome::UnknownTransaction,
            });
        }

        let candidate = db::get_candidate(tx, transaction.candidate_id)?
            .ok_or_else(|| LedgerError::NotFound("Candidate not found".to_string()))?;

        payments::record_payment_tx(
            tx,
            &candidate,
            &NewPayment {
                candidate_id: candidate.id,
                amount: transaction.amount,
                payment_type: transaction.payment_type,
                payment_method: PaymentMethod::Gateway,
                transaction_id: Some(tran_id.to_string()),
                notes: Some("Gateway online payment".to_string()),
            },
        )?;

        tracing::info!(
            %tran_id,
            candidate_id = candidate.id,
            amount = %transaction.amount,
            "gateway payment reconciled"
        );

        Ok(SuccessOutcome::Credited {
            candidate_id: candidate.id,
        })
    })
}

/// Mark a transaction `failed`. Idempotent; never records a payment.
pub fn apply_fail(ledger: &Ledger, tran_id: &str) -> Result<TerminalOutcome> {
    apply_terminal(ledger, tran_id, TransactionStatus::Failed)
}

/// Mark a transaction `cancelled`. Idempotent; never records a payment.
pub fn apply_cancel(ledger: &Ledger, tran_id: &str) -> Result<TerminalOutcome> {
    apply_terminal(ledger, tran_id, TransactionStatus::Cancelled)
}

/// IPN is the gateway's delivery path that does not depend on the user's
/// browser coming back; it drives the same idempotent success logic.
pub fn apply_ipn(ledger: &Ledger, tran_id: &str, gateway_status: &str) -> Result<SuccessOutcome> {
    tracing::info!(%tran_id, %gateway_status, "ipn notification received");
    apply_success(ledger, tran_id, gateway_status)
}

fn apply_terminal(
    ledger: &Ledger,
    tran_id: &str,
    target: TransactionStatus,
) -> Result<TerminalOutcome> {
    debug_assert!(target.is_terminal());

    ledger.with_transaction(|tx| {
        let transaction = match db::get_gateway_transaction(tx, tran_id)? {
            Some(t) => t,
            None => {
                tracing::warn!(%tran_id, target = %target, "notification for unknown transaction");
                return Ok(TerminalOutcome::UnknownTransaction);
            }
        };

        if transaction.status.is_terminal() {
            return Ok(TerminalOutcome::AlreadyTerminal {
                status: transaction.status,
                candidate_id: transaction.candidate_id,
            });
        }

        tx.execute(
            "UPDATE gateway_transactions SET status = ?1
             WHERE tran_id = ?2 AND status = 'pending'",
            params![target.as_str(), tran_id],
        )
        .map_err(LedgerError::from)?;

        tracing::info!(%tran_id, status = %target, "gateway transaction closed");

        Ok(TerminalOutcome::Marked {
            candidate_id: transaction.candidate_id,
        })
    })
}
