// Recruitment Ledger - API Server
//
// HTTP boundary over the ledger core. Authenticated routes trust the
// principal headers set by the upstream auth proxy; gateway callbacks are
// unauthenticated by design and always answer with a landing-page
// redirect, never a raw error body.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recruit_ledger::{
    auth::{Principal, Role},
    db, payments,
    reconcile::{self, SuccessOutcome, TerminalOutcome},
    gateway::{GatewayClient, SessionRequest},
    Ledger, LedgerError, NewPayment, Payment, PaymentReceipt,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    ledger: Ledger,
    gateway: Arc<GatewayClient>,
    /// Public base URL for callback and landing redirects; when unset the
    /// request's forwarded proto/host is used instead.
    app_url: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

/// Maps the ledger taxonomy onto HTTP statuses. Storage detail never
/// reaches the client on a 500.
struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0 {
            LedgerError::Validation(m) => (StatusCode::BAD_REQUEST, m),
            LedgerError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            LedgerError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            LedgerError::Constraint(m) => (StatusCode::CONFLICT, m),
            LedgerError::Transaction(m) => {
                tracing::error!(detail = %m, "transaction failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Transaction failed".to_string(),
                )
            }
            LedgerError::Gateway(m) => (StatusCode::BAD_GATEWAY, m),
        };

        (status, Json(ErrorBody { message })).into_response()
    }
}

/// Principal supplied by the upstream authentication layer via trusted
/// headers. This service does not verify tokens itself.
struct AuthPrincipal(Principal);

#[async_trait]
impl<S> FromRequestParts<S> for AuthPrincipal
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorBody>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-principal-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let role = parts
            .headers
            .get("x-principal-role")
            .and_then(|v| v.to_str().ok())
            .and_then(Role::from_str);

        match (id, role) {
            (Some(id), Some(role)) => Ok(AuthPrincipal(Principal::new(id, role))),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    message: "Missing or invalid principal headers".to_string(),
                }),
            )),
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /api/health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: recruit_ledger::VERSION,
    })
}

#[derive(Serialize)]
struct PaymentCreated {
    id: i64,
    message: &'static str,
}

/// POST /api/payments - record a cash or gateway payment
async fn record_payment_handler(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Json(payload): Json<NewPayment>,
) -> Result<(StatusCode, Json<PaymentCreated>), ApiError> {
    let id = payments::record_payment(&state.ledger, &principal, &payload)?;

    Ok((
        StatusCode::CREATED,
        Json(PaymentCreated {
            id,
            message: "Payment recorded successfully",
        }),
    ))
}

/// GET /api/payments/candidate/:id - payment history, newest first
async fn candidate_payments_handler(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(candidate_id): Path<i64>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let history = payments::payments_for_candidate(&state.ledger, &principal, candidate_id)?;
    Ok(Json(history))
}

/// GET /api/payments/transaction/:tran_id - receipt lookup
async fn payment_receipt_handler(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(tran_id): Path<String>,
) -> Result<Json<PaymentReceipt>, ApiError> {
    let receipt = payments::payment_by_transaction(&state.ledger, &principal, &tran_id)?;
    Ok(Json(receipt))
}

#[derive(Serialize)]
struct SessionCreated {
    redirect_url: String,
}

/// POST /api/gateway/init - open a hosted checkout session
async fn init_session_handler(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    headers: HeaderMap,
    Json(payload): Json<SessionRequest>,
) -> Result<Json<SessionCreated>, ApiError> {
    principal.ensure_may_record_payments()?;
    let candidate = state
        .ledger
        .with_connection(|conn| db::get_candidate(conn, payload.candidate_id))?
        .ok_or_else(|| LedgerError::NotFound("Candidate not found".to_string()))?;
    principal.ensure_may_access(&candidate)?;

    let base = landing_base(&state, &headers);
    let redirect_url = state
        .gateway
        .init_session(&state.ledger, &payload, &base)
        .await?;

    Ok(Json(SessionCreated { redirect_url }))
}

// ============================================================================
// Gateway Callbacks
// ============================================================================

/// Form body the gateway posts back to us
#[derive(Debug, Deserialize)]
struct CallbackForm {
    #[serde(default)]
    tran_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// POST /api/gateway/success
async fn success_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CallbackForm>,
) -> Redirect {
    let base = landing_base(&state, &headers);
    let Some(tran_id) = form.tran_id else {
        return fail_redirect(&base, "Missing transaction id", None);
    };
    let status = form.status.unwrap_or_default();

    match reconcile::apply_success(&state.ledger, &tran_id, &status) {
        Ok(SuccessOutcome::Credited { candidate_id })
        | Ok(SuccessOutcome::AlreadyCredited { candidate_id }) => Redirect::to(&format!(
            "{base}/payment/success/{tran_id}?candidate_id={candidate_id}"
        )),
        Ok(SuccessOutcome::Rejected { reason }) => fail_redirect(&base, &reason, Some(&tran_id)),
        Ok(SuccessOutcome::UnknownTransaction) => {
            fail_redirect(&base, "Transaction Not Found", Some(&tran_id))
        }
        Ok(SuccessOutcome::Superseded { status, .. }) => fail_redirect(
            &base,
            &format!("Transaction already {status}"),
            Some(&tran_id),
        ),
        Err(err) => {
            tracing::error!(%tran_id, error = %err, "success callback failed to reconcile");
            fail_redirect(&base, "Database Update Failed", Some(&tran_id))
        }
    }
}

/// POST /api/gateway/fail
async fn fail_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CallbackForm>,
) -> Redirect {
    let base = landing_base(&state, &headers);
    let Some(tran_id) = form.tran_id else {
        return fail_redirect(&base, "Payment Failed", None);
    };

    match reconcile::apply_fail(&state.ledger, &tran_id) {
        Ok(TerminalOutcome::Marked { candidate_id })
        | Ok(TerminalOutcome::AlreadyTerminal { candidate_id, .. }) => Redirect::to(&format!(
            "{base}/payment/fail?msg={}&tran_id={tran_id}&candidate_id={candidate_id}",
            urlencoding::encode("Payment Failed")
        )),
        Ok(TerminalOutcome::UnknownTransaction) => {
            fail_redirect(&base, "Transaction Not Found", Some(&tran_id))
        }
        Err(err) => {
            tracing::error!(%tran_id, error = %err, "fail callback errored");
            fail_redirect(&base, "Payment Failed", Some(&tran_id))
        }
    }
}

/// POST /api/gateway/cancel
async fn cancel_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CallbackForm>,
) -> Redirect {
    let base = landing_base(&state, &headers);
    let Some(tran_id) = form.tran_id else {
        return fail_redirect(&base, "Payment Cancelled", None);
    };

    match reconcile::apply_cancel(&state.ledger, &tran_id) {
        Ok(TerminalOutcome::Marked { candidate_id })
        | Ok(TerminalOutcome::AlreadyTerminal { candidate_id, .. }) => Redirect::to(&format!(
            "{base}/payment/cancel?tran_id={tran_id}&candidate_id={candidate_id}"
        )),
        Ok(TerminalOutcome::UnknownTransaction) => {
            fail_redirect(&base, "Transaction Not Found", Some(&tran_id))
        }
        Err(err) => {
            tracing::error!(%tran_id, error = %err, "cancel callback errored");
            fail_redirect(&base, "Payment Cancelled", Some(&tran_id))
        }
    }
}

/// POST /api/gateway/ipn - reliable delivery path, bare 200 acknowledgment
async fn ipn_callback(
    State(state): State<AppState>,
    Form(form): Form<CallbackForm>,
) -> impl IntoResponse {
    if let Some(tran_id) = form.tran_id {
        let status = form.status.unwrap_or_default();
        match reconcile::apply_ipn(&state.ledger, &tran_id, &status) {
            Ok(outcome) => tracing::info!(%tran_id, ?outcome, "ipn processed"),
            Err(err) => tracing::error!(%tran_id, error = %err, "ipn reconciliation failed"),
        }
    }

    (StatusCode::OK, "OK")
}

fn landing_base(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.app_url {
        return url.trim_end_matches('/').to_string();
    }
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:3000");
    format!("{proto}://{host}")
}

fn fail_redirect(base: &str, msg: &str, tran_id: Option<&str>) -> Redirect {
    let mut url = format!("{base}/payment/fail?msg={}", urlencoding::encode(msg));
    if let Some(tran_id) = tran_id {
        url.push_str(&format!("&tran_id={tran_id}"));
    }
    Redirect::to(&url)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "recruitment.db".into());
    let ledger = Ledger::open(std::path::Path::new(&db_path))?;
    tracing::info!(%db_path, "ledger database opened");

    let gateway = Arc::new(GatewayClient::from_env()?);
    let app_url = std::env::var("APP_URL").ok();
    if app_url.is_none() {
        tracing::warn!("APP_URL not set - callback URLs will be derived per request");
    }

    let state = AppState {
        ledger,
        gateway,
        app_url,
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/payments", post(record_payment_handler))
        .route("/payments/candidate/:id", get(candidate_payments_handler))
        .route(
            "/payments/transaction/:tran_id",
            get(payment_receipt_handler),
        )
        .route("/gateway/init", post(init_session_handler))
        .route("/gateway/success", post(success_callback))
        .route("/gateway/fail", post(fail_callback))
        .route("/gateway/cancel", post(cancel_callback))
        .route("/gateway/ipn", post(ipn_callback))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "recruitment ledger server running");

    axum::serve(listener, app).await?;

    Ok(())
}
