use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{LedgerError, Result};

// ============================================================================
// CATEGORICAL COLUMNS
// ============================================================================

/// What the candidate is paying for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Visa,
    Medical,
    Ticket,
    Service,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Visa => "visa",
            PaymentType::Medical => "medical",
            PaymentType::Ticket => "ticket",
            PaymentType::Service => "service",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "visa" => Some(PaymentType::Visa),
            "medical" => Some(PaymentType::Medical),
            "ticket" => Some(PaymentType::Ticket),
            "service" => Some(PaymentType::Service),
            _ => None,
        }
    }
}

/// How the funds arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Gateway,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Gateway => "gateway",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cash" => Some(PaymentMethod::Cash),
            "gateway" => Some(PaymentMethod::Gateway),
            _ => None,
        }
    }
}

/// Gateway transaction lifecycle. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "success" => Some(TransactionStatus::Success),
            "failed" => Some(TransactionStatus::Failed),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// A candidate and their running financial totals.
///
/// Invariant: `due_amount == package_amount - total_paid`, and
/// `total_paid` equals the sum of all payment rows for this candidate.
/// Only the payment recorder mutates the financial fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    /// Staff member responsible for this candidate
    pub agent_id: i64,
    pub name: String,
    pub passport_number: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub package_amount: Decimal,
    pub total_paid: Decimal,
    pub due_amount: Decimal,
    /// Pipeline stage, owned by the candidate-intake layer
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one funds-received event. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub candidate_id: i64,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub payment_method: PaymentMethod,
    /// Correlation token when the payment came through the gateway
    pub transaction_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One external payment attempt, keyed by the unique `tran_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub id: i64,
    pub candidate_id: i64,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub tran_id: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Candidate-intake input (supplied by the excluded CRUD layer, the seed
/// command, and tests).
#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub agent_id: i64,
    pub name: String,
    pub passport_number: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub package_amount: Decimal,
    pub status: String,
}

// ============================================================================
// LEDGER HANDLE
// ============================================================================

/// Shared handle to the durable ledger state.
///
/// One connection guarded by a mutex; `with_transaction` holds the guard
/// for the whole unit, so multi-statement read-modify-write sequences are
/// serialized process-wide in addition to being transactional.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| LedgerError::Transaction(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    /// In-memory ledger, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Transaction(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run statements against the shared connection outside an explicit
    /// transaction. Single statements are atomic on their own; anything
    /// multi-statement belongs in `with_transaction`.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| LedgerError::Transaction("ledger connection poisoned".to_string()))?;
        f(&conn)
    }

    /// Run `f` inside one database transaction: every statement commits
    /// together or none do. An `Err` from `f` rolls the unit back and is
    /// returned unchanged; no partial application is ever observable.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| LedgerError::Transaction("ledger connection poisoned".to_string()))?;
        let tx = conn.transaction().map_err(LedgerError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(LedgerError::from)?;
        Ok(value)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery, and referential integrity on
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(LedgerError::from)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(LedgerError::from)?;

    // Monetary columns are TEXT: decimals round-trip without float loss.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            passport_number TEXT UNIQUE NOT NULL,
            phone TEXT,
            email TEXT,
            package_amount TEXT NOT NULL DEFAULT '0',
            total_paid TEXT NOT NULL DEFAULT '0',
            due_amount TEXT NOT NULL DEFAULT '0',
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )",
        [],
    )
    .map_err(LedgerError::from)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            candidate_id INTEGER NOT NULL,
            amount TEXT NOT NULL,
            payment_type TEXT CHECK(payment_type IN ('visa', 'medical', 'ticket', 'service')) NOT NULL,
            payment_method TEXT CHECK(payment_method IN ('cash', 'gateway')) NOT NULL,
            transaction_id TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (candidate_id) REFERENCES candidates(id) ON DELETE CASCADE
        )",
        [],
    )
    .map_err(LedgerError::from)?;

    // tran_id UNIQUE is the idempotency key of the whole callback protocol
    conn.execute(
        "CREATE TABLE IF NOT EXISTS gateway_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            candidate_id INTEGER NOT NULL,
            amount TEXT NOT NULL,
            payment_type TEXT NOT NULL,
            tran_id TEXT UNIQUE NOT NULL,
            status TEXT CHECK(status IN ('pending', 'success', 'failed', 'cancelled')) NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            FOREIGN KEY (candidate_id) REFERENCES candidates(id) ON DELETE CASCADE
        )",
        [],
    )
    .map_err(LedgerError::from)?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_candidate ON payments(candidate_id)",
        [],
    )
    .map_err(LedgerError::from)?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_transaction ON payments(transaction_id)",
        [],
    )
    .map_err(LedgerError::from)?;

    Ok(())
}

// ============================================================================
// ROW MAPPING HELPERS
// ============================================================================

pub(crate) fn decimal_column(raw: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str(&raw).map_err(|_| rusqlite::Error::InvalidQuery)
}

pub(crate) fn timestamp_column(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn map_candidate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candidate> {
    Ok(Candidate {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        name: row.get(2)?,
        passport_number: row.get(3)?,
        phone: row.get(4)?,
        email: row.get(5)?,
        package_amount: decimal_column(row.get(6)?)?,
        total_paid: decimal_column(row.get(7)?)?,
        due_amount: decimal_column(row.get(8)?)?,
        status: row.get(9)?,
        created_at: timestamp_column(row.get(10)?)?,
    })
}

fn map_gateway_transaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GatewayTransaction> {
    let payment_type: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(GatewayTransaction {
        id: row.get(0)?,
        candidate_id: row.get(1)?,
        amount: decimal_column(row.get(2)?)?,
        payment_type: PaymentType::from_str(&payment_type).ok_or(rusqlite::Error::InvalidQuery)?,
        tran_id: row.get(4)?,
        status: TransactionStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        created_at: timestamp_column(row.get(6)?)?,
    })
}

const CANDIDATE_COLUMNS: &str = "id, agent_id, name, passport_number, phone, email,
        package_amount, total_paid, due_amount, status, created_at";

const GATEWAY_TRANSACTION_COLUMNS: &str =
    "id, candidate_id, amount, payment_type, tran_id, status, created_at";

// ============================================================================
// CANDIDATE INTAKE & READS
// ============================================================================

/// Intake boundary: create a candidate with zeroed payment history.
pub fn insert_candidate(conn: &Connection, candidate: &NewCandidate) -> Result<i64> {
    conn.execute(
        "INSERT INTO candidates (
            agent_id, name, passport_number, phone, email,
            package_amount, total_paid, due_amount, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            candidate.agent_id,
            candidate.name,
            candidate.passport_number,
            candidate.phone,
            candidate.email,
            candidate.package_amount.to_string(),
            Decimal::ZERO.to_string(),
            candidate.package_amount.to_string(),
            candidate.status,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(LedgerError::from)?;

    Ok(conn.last_insert_rowid())
}

pub fn get_candidate(conn: &Connection, id: i64) -> Result<Option<Candidate>> {
    let candidate = conn
        .query_row(
            &format!("SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = ?1"),
            params![id],
            map_candidate_row,
        )
        .optional()
        .map_err(LedgerError::from)?;

    Ok(candidate)
}

pub fn count_candidates(conn: &Connection) -> Result<i64> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM candidates", [], |row| row.get(0))
        .map_err(LedgerError::from)?;

    Ok(count)
}

pub fn get_all_candidates(conn: &Connection) -> Result<Vec<Candidate>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates ORDER BY id"
        ))
        .map_err(LedgerError::from)?;

    let candidates = stmt
        .query_map([], map_candidate_row)
        .map_err(LedgerError::from)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(LedgerError::from)?;

    Ok(candidates)
}

// ============================================================================
// GATEWAY TRANSACTIONS
// ============================================================================

/// Persist the durable record of intent for one external payment attempt.
/// Inserted in `pending` state before the gateway is ever contacted.
pub fn insert_gateway_transaction(
    conn: &Connection,
    candidate_id: i64,
    amount: Decimal,
    payment_type: PaymentType,
    tran_id: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO gateway_transactions (
            candidate_id, amount, payment_type, tran_id, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![
            candidate_id,
            amount.to_string(),
            payment_type.as_str(),
            tran_id,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(LedgerError::from)?;

    Ok(conn.last_insert_rowid())
}

pub fn get_gateway_transaction(
    conn: &Connection,
    tran_id: &str,
) -> Result<Option<GatewayTransaction>> {
    let transaction = conn
        .query_row(
            &format!(
                "SELECT {GATEWAY_TRANSACTION_COLUMNS} FROM gateway_transactions WHERE tran_id = ?1"
            ),
            params![tran_id],
            map_gateway_transaction_row,
        )
        .optional()
        .map_err(LedgerError::from)?;

    Ok(transaction)
}

// ============================================================================
// TOTALS VERIFICATION
// ============================================================================

/// One candidate whose stored totals disagree with their payment rows.
#[derive(Debug, Clone)]
pub struct TotalsDrift {
    pub candidate_id: i64,
    pub name: String,
    pub recorded_total: Decimal,
    pub computed_total: Decimal,
    pub recorded_due: Decimal,
    pub expected_due: Decimal,
}

/// Recompute every candidate's totals from the payment history and report
/// the rows where the stored values drifted. An empty result means the
/// ledger invariant holds for the whole database.
pub fn totals_drift(conn: &Connection) -> Result<Vec<TotalsDrift>> {
    let candidates = get_all_candidates(conn)?;
    let mut drift = Vec::new();

    let mut stmt = conn
        .prepare("SELECT amount FROM payments WHERE candidate_id = ?1")
        .map_err(LedgerError::from)?;

    for candidate in candidates {
        let amounts = stmt
            .query_map(params![candidate.id], |row| decimal_column(row.get(0)?))
            .map_err(LedgerError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(LedgerError::from)?;

        let computed_total: Decimal = amounts.iter().copied().sum();
        let expected_due = candidate.package_amount - computed_total;

        if computed_total != candidate.total_paid || expected_due != candidate.due_amount {
            drift.push(TotalsDrift {
                candidate_id: candidate.id,
                name: candidate.name,
                recorded_total: candidate.total_paid,
                computed_total,
                recorded_due: candidate.due_amount,
                expected_due,
            });
        }
    }

    Ok(drift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_candidate(passport: &str, agent_id: i64, package: Decimal) -> NewCandidate {
        NewCandidate {
            agent_id,
            name: format!("Candidate {passport}"),
            passport_number: passport.to_string(),
            phone: Some("01811000111".to_string()),
            email: Some("candidate@example.com".to_string()),
            package_amount: package,
            status: "pending".to_string(),
        }
    }

    #[test]
    fn test_insert_and_get_candidate() {
        let ledger = Ledger::open_in_memory().unwrap();

        let id = ledger
            .with_connection(|conn| {
                insert_candidate(conn, &test_candidate("A01234567", 3, dec!(450000)))
            })
            .unwrap();

        let candidate = ledger
            .with_connection(|conn| get_candidate(conn, id))
            .unwrap()
            .unwrap();

        assert_eq!(candidate.agent_id, 3);
        assert_eq!(candidate.package_amount, dec!(450000));
        assert_eq!(candidate.total_paid, Decimal::ZERO);
        assert_eq!(candidate.due_amount, dec!(450000));
    }

    #[test]
    fn test_duplicate_passport_is_constraint_violation() {
        let ledger = Ledger::open_in_memory().unwrap();

        ledger
            .with_connection(|conn| {
                insert_candidate(conn, &test_candidate("A01234567", 3, dec!(100)))
            })
            .unwrap();

        let result = ledger.with_connection(|conn| {
            insert_candidate(conn, &test_candidate("A01234567", 4, dec!(200)))
        });

        assert!(matches!(result, Err(LedgerError::Constraint(_))));
    }

    #[test]
    fn test_duplicate_tran_id_is_constraint_violation() {
        let ledger = Ledger::open_in_memory().unwrap();

        let id = ledger
            .with_connection(|conn| {
                insert_candidate(conn, &test_candidate("A01234567", 3, dec!(100)))
            })
            .unwrap();

        ledger
            .with_connection(|conn| {
                insert_gateway_transaction(conn, id, dec!(50), PaymentType::Visa, "GW-AAAA0001")
            })
            .unwrap();

        let result = ledger.with_connection(|conn| {
            insert_gateway_transaction(conn, id, dec!(60), PaymentType::Visa, "GW-AAAA0001")
        });

        assert!(matches!(result, Err(LedgerError::Constraint(_))));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let ledger = Ledger::open_in_memory().unwrap();

        let result: Result<()> = ledger.with_transaction(|tx| {
            insert_candidate(tx, &test_candidate("B98765432", 3, dec!(100)))?;
            Err(LedgerError::Validation("forced abort".to_string()))
        });
        assert!(result.is_err());

        let count = ledger.with_connection(count_candidates).unwrap();
        assert_eq!(count, 0, "aborted unit must leave no rows behind");
    }

    #[test]
    fn test_totals_drift_detects_corruption() {
        let ledger = Ledger::open_in_memory().unwrap();

        let id = ledger
            .with_connection(|conn| {
                insert_candidate(conn, &test_candidate("A01234567", 3, dec!(1000)))
            })
            .unwrap();

        // Clean ledger: no drift
        let drift = ledger.with_connection(totals_drift).unwrap();
        assert!(drift.is_empty());

        // Corrupt the stored totals out-of-band
        ledger
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE candidates SET total_paid = '500' WHERE id = ?1",
                    params![id],
                )
                .map_err(LedgerError::from)
            })
            .unwrap();

        let drift = ledger.with_connection(totals_drift).unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].recorded_total, dec!(500));
        assert_eq!(drift[0].computed_total, Decimal::ZERO);
    }

    #[test]
    fn test_ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recruitment.db");

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .with_connection(|conn| {
                    insert_candidate(conn, &test_candidate("A01234567", 3, dec!(1000)))
                })
                .unwrap();
        }

        let reopened = Ledger::open(&path).unwrap();
        let count = reopened.with_connection(count_candidates).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Success,
            TransactionStatus::Failed,
            TransactionStatus::Cancelled,
        ] {
            assert_eq!(TransactionStatus::from_str(status.as_str()), Some(status));
        }
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Success.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Cancelled.is_terminal());
    }
}
