// Gateway session manager: opens hosted-checkout sessions with the
// external payment gateway.
//
// The pending transaction row is written before the gateway is contacted;
// it is the durable record of intent the callback reconciler later keys
// on. The network call itself happens outside any database transaction.
// This is the only module that talks to the outside world, and it never
// touches candidate or payment rows.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use crate::db::{self, Ledger, PaymentType};
use crate::error::{LedgerError, Result};

const DEFAULT_API_URL: &str = "https://sandbox.sslcommerz.com/gwprocess/v4/api.php";
const DEFAULT_STORE_ID: &str = "testbox";
const DEFAULT_STORE_PASSWORD: &str = "qwerty";
const CURRENCY: &str = "BDT";
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway credentials and endpoint
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub store_id: String,
    pub store_password: String,
}

impl GatewayConfig {
    /// Load from `GATEWAY_API_URL`, `GATEWAY_STORE_ID` and
    /// `GATEWAY_STORE_PASSWORD`, falling back to the sandbox defaults.
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("GATEWAY_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            store_id: std::env::var("GATEWAY_STORE_ID")
                .unwrap_or_else(|_| DEFAULT_STORE_ID.to_string()),
            store_password: std::env::var("GATEWAY_STORE_PASSWORD")
                .unwrap_or_else(|_| DEFAULT_STORE_PASSWORD.to_string()),
        }
    }
}

/// The four notification endpoints handed to the gateway, derived by
/// appending fixed paths to the application's public base URL.
#[derive(Debug, Clone)]
pub struct CallbackUrls {
    pub success: String,
    pub fail: String,
    pub cancel: String,
    pub ipn: String,
}

impl CallbackUrls {
    pub fn derive(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            success: format!("{base}/api/gateway/success"),
            fail: format!("{base}/api/gateway/fail"),
            cancel: format!("{base}/api/gateway/cancel"),
            ipn: format!("{base}/api/gateway/ipn"),
        }
    }
}

/// Request to open an online payment session for a candidate
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub candidate_id: i64,
    pub amount: Decimal,
    pub payment_type: PaymentType,
}

/// Wire shape of the gateway's session-initiation reply
#[derive(Debug, Deserialize)]
struct SessionApiResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "GatewayPageURL", default)]
    gateway_page_url: Option<String>,
    #[serde(default)]
    failedreason: Option<String>,
}

/// Correlation token for one payment attempt: `GW-` plus eight uppercase
/// hex characters of a v4 UUID. Unique with overwhelming probability; the
/// UNIQUE column on insert is the backstop.
pub fn new_tran_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("GW-{}", &hex[..8])
}

/// HTTP client for the gateway's session-initiation endpoint
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Gateway(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(GatewayConfig::from_env())
    }

    /// Open a payment session: persist the `pending` transaction, then ask
    /// the gateway for a hosted checkout page. Returns the redirect URL.
    ///
    /// A gateway failure (declared or network) leaves the `pending` row in
    /// place. No sweeper expires such rows; they either get resolved by a
    /// late callback or stay pending.
    pub async fn init_session(
        &self,
        ledger: &Ledger,
        request: &SessionRequest,
        callback_base_url: &str,
    ) -> Result<String> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::Validation(
                "Payment amount must be a positive number".to_string(),
            ));
        }

        let candidate = ledger
            .with_connection(|conn| db::get_candidate(conn, request.candidate_id))?
            .ok_or_else(|| LedgerError::NotFound("Candidate not found".to_string()))?;

        let tran_id = self.persist_pending(ledger, request)?;
        let urls = CallbackUrls::derive(callback_base_url);

        tracing::info!(
            %tran_id,
            candidate_id = request.candidate_id,
            amount = %request.amount,
            "opening gateway session"
        );

        let form = vec![
            ("store_id", self.config.store_id.clone()),
            ("store_passwd", self.config.store_password.clone()),
            ("total_amount", request.amount.to_string()),
            ("currency", CURRENCY.to_string()),
            ("tran_id", tran_id.clone()),
            ("success_url", urls.success),
            ("fail_url", urls.fail),
            ("cancel_url", urls.cancel),
            ("ipn_url", urls.ipn),
            ("shipping_method", "NO".to_string()),
            ("product_name", request.payment_type.as_str().to_string()),
            ("product_category", "Service".to_string()),
            ("product_profile", "general".to_string()),
            ("cus_name", candidate.name.clone()),
            (
                "cus_email",
                candidate
                    .email
                    .clone()
                    .unwrap_or_else(|| "customer@example.com".to_string()),
            ),
            (
                "cus_phone",
                candidate
                    .phone
                    .clone()
                    .unwrap_or_else(|| "01700000000".to_string()),
            ),
            ("cus_add1", "Dhaka".to_string()),
            ("cus_city", "Dhaka".to_string()),
            ("cus_country", "Bangladesh".to_string()),
        ];

        let response = self
            .http
            .post(&self.config.api_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| LedgerError::Gateway(format!("gateway request failed: {e}")))?;

        let body: SessionApiResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Gateway(format!("unreadable gateway response: {e}")))?;

        if body.status.as_deref() == Some("SUCCESS") {
            body.gateway_page_url.ok_or_else(|| {
                LedgerError::Gateway("gateway returned no redirect URL".to_string())
            })
        } else {
            let reason = body
                .failedreason
                .unwrap_or_else(|| "Failed to initialize payment".to_string());
            tracing::warn!(%tran_id, %reason, "gateway declined session");
            Err(LedgerError::Gateway(reason))
        }
    }

    /// Insert the `pending` row, retrying once with a fresh id if the
    /// generated `tran_id` collides.
    fn persist_pending(&self, ledger: &Ledger, request: &SessionRequest) -> Result<String> {
        let mut tran_id = new_tran_id();

        for attempt in 0..2 {
            let result = ledger.with_connection(|conn| {
                db::insert_gateway_transaction(
                    conn,
                    request.candidate_id,
                    request.amount,
                    request.payment_type,
                    &tran_id,
                )
            });

            match result {
                Ok(_) => return Ok(tran_id),
                Err(LedgerError::Constraint(_)) if attempt == 0 => {
                    tracing::warn!(%tran_id, "tran_id collision, retrying with a fresh id");
                    tran_id = new_tran_id();
                }
                Err(e) => return Err(e),
            }
        }

        Err(LedgerError::Constraint(
            "could not allocate a unique tran_id".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewCandidate, TransactionStatus};
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    fn seed_candidate(ledger: &Ledger) -> i64 {
        ledger
            .with_connection(|conn| {
                db::insert_candidate(
                    conn,
                    &NewCandidate {
                        agent_id: 3,
                        name: "Karim Ali".to_string(),
                        passport_number: "B98765432".to_string(),
                        phone: None,
                        email: None,
                        package_amount: dec!(450000),
                        status: "pending".to_string(),
                    },
                )
            })
            .unwrap()
    }

    #[test]
    fn test_callback_urls_strip_trailing_slash() {
        let urls = CallbackUrls::derive("https://office.example.com/");
        assert_eq!(urls.success, "https://office.example.com/api/gateway/success");
        assert_eq!(urls.fail, "https://office.example.com/api/gateway/fail");
        assert_eq!(urls.cancel, "https://office.example.com/api/gateway/cancel");
        assert_eq!(urls.ipn, "https://office.example.com/api/gateway/ipn");
    }

    #[test]
    fn test_tran_id_shape() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = new_tran_id();
            assert!(id.starts_with("GW-"));
            assert_eq!(id.len(), 11);
            assert!(seen.insert(id), "generated ids must not repeat");
        }
    }

    #[test]
    fn test_session_response_parsing() {
        let ok: SessionApiResponse = serde_json::from_str(
            r#"{"status":"SUCCESS","GatewayPageURL":"https://gw.example.com/pay/abc"}"#,
        )
        .unwrap();
        assert_eq!(ok.status.as_deref(), Some("SUCCESS"));
        assert_eq!(
            ok.gateway_page_url.as_deref(),
            Some("https://gw.example.com/pay/abc")
        );

        let declined: SessionApiResponse =
            serde_json::from_str(r#"{"status":"FAILED","failedreason":"Store is inactive"}"#)
                .unwrap();
        assert_eq!(declined.failedreason.as_deref(), Some("Store is inactive"));
        assert!(declined.gateway_page_url.is_none());
    }

    #[test]
    fn test_pending_row_written_without_touching_totals() {
        let ledger = Ledger::open_in_memory().unwrap();
        let candidate_id = seed_candidate(&ledger);
        let client = GatewayClient::new(GatewayConfig::from_env()).unwrap();

        let tran_id = client
            .persist_pending(
                &ledger,
                &SessionRequest {
                    candidate_id,
                    amount: dec!(100000),
                    payment_type: PaymentType::Visa,
                },
            )
            .unwrap();

        let transaction = ledger
            .with_connection(|conn| db::get_gateway_transaction(conn, &tran_id))
            .unwrap()
            .unwrap();
        assert_eq!(transaction.status, TransactionStatus::Pending);
        assert_eq!(transaction.amount, dec!(100000));

        // Opening a session never moves money
        let candidate = ledger
            .with_connection(|conn| db::get_candidate(conn, candidate_id))
            .unwrap()
            .unwrap();
        assert_eq!(candidate.total_paid, dec!(0));
        assert_eq!(candidate.due_amount, dec!(450000));
    }

    #[test]
    fn test_repeated_sessions_allocate_distinct_ids() {
        let ledger = Ledger::open_in_memory().unwrap();
        let candidate_id = seed_candidate(&ledger);
        let client = GatewayClient::new(GatewayConfig::from_env()).unwrap();

        let request = SessionRequest {
            candidate_id,
            amount: dec!(5000),
            payment_type: PaymentType::Ticket,
        };

        // Two allocations against the same ledger must both land, even
        // though each draws from the same id space.
        let first = client.persist_pending(&ledger, &request).unwrap();
        let second = client.persist_pending(&ledger, &request).unwrap();
        assert_ne!(first, second);
    }
}
