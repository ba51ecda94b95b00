// Recruitment Ledger - Core Library
// Exposes all modules for use in the admin CLI, API server, and tests

pub mod auth;
pub mod db;
pub mod error;
pub mod gateway;
pub mod payments;
pub mod reconcile;

// Re-export commonly used types
pub use auth::{Principal, Role};
pub use db::{
    count_candidates, get_all_candidates, get_candidate, get_gateway_transaction,
    insert_candidate, insert_gateway_transaction, setup_database, totals_drift, Candidate,
    GatewayTransaction, Ledger, NewCandidate, Payment, PaymentMethod, PaymentType, TotalsDrift,
    TransactionStatus,
};
pub use error::LedgerError;
pub use gateway::{new_tran_id, CallbackUrls, GatewayClient, GatewayConfig, SessionRequest};
pub use payments::{
    payment_by_transaction, payments_for_candidate, record_payment, record_payment_tx, NewPayment,
    PaymentReceipt,
};
pub use reconcile::{
    apply_cancel, apply_fail, apply_ipn, apply_success, SuccessOutcome, TerminalOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
