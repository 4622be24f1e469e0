//! Axum-based HTTP gateway: Polar webhook intake and the dashboard JSON API.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (30s)
//! - Per-client sliding-window rate limiting on the webhook
//! - Standard Webhooks signature verification when a secret is configured
//! - Optional bearer token on dashboard routes

use crate::billing::polar::{HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::billing::{
    decode_event, verify_signature, CreditReconciler, OrderPaid, ReconcileError, SignedHeaders,
    WebhookEvent,
};
use crate::config::Config;
use crate::projects::{apply_query, ProjectQuery, UserStats};
use crate::store::SqliteStore;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by webhook rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often the rate limiter sweeps stale client entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

fn hash_token(value: &str) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Whether binding `host` would expose the gateway beyond loopback.
pub fn is_public_bind(host: &str) -> bool {
    !matches!(host, "127.0.0.1" | "localhost" | "::1" | "[::1]")
}

/// Per-client webhook budget over a sliding window. A limit of 0 disables it.
#[derive(Debug)]
pub struct WebhookRateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    hits: HashMap<String, VecDeque<Instant>>,
    swept_at: Instant,
}

fn expire(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while hits
        .front()
        .is_some_and(|hit| now.saturating_duration_since(*hit) >= window)
    {
        hits.pop_front();
    }
}

impl WebhookRateLimiter {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            state: Mutex::new(LimiterState {
                hits: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    pub fn check(&self, client: &str) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> bool {
        if self.max_requests == 0 {
            return true;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        // Forget idle clients so the map stays bounded.
        if now.saturating_duration_since(state.swept_at)
            >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS)
        {
            let window = self.window;
            state.hits.retain(|_, hits| {
                expire(hits, now, window);
                !hits.is_empty()
            });
            state.swept_at = now;
        }

        let hits = state.hits.entry(client.to_owned()).or_default();
        expire(hits, now, self.window);
        if hits.len() >= self.max_requests as usize {
            return false;
        }
        hits.push_back(now);
        true
    }
}

/// First forwarded address, as set by the reverse proxy in front of the gateway.
fn webhook_client(headers: &HeaderMap) -> &str {
    ["x-forwarded-for", "x-real-ip"]
        .into_iter()
        .filter_map(|name| headers.get(name)?.to_str().ok())
        .filter_map(|value| value.split(',').next().map(str::trim))
        .find(|addr| !addr.is_empty())
        .unwrap_or("unknown")
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<CreditReconciler>,
    pub store: Arc<SqliteStore>,
    /// Polar endpoint secret; `None` skips signature verification.
    pub webhook_secret: Option<Arc<str>>,
    /// SHA-256 hash of the dashboard bearer token (hex-encoded), never plaintext.
    pub dashboard_token_hash: Option<Arc<str>>,
    pub rate_limiter: Arc<WebhookRateLimiter>,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<SqliteStore>) -> Result<Self> {
        let reconciler = CreditReconciler::new(
            store.clone(),
            config.catalog()?,
            config.billing.unknown_product,
        );

        let webhook_secret = config
            .billing
            .webhook_secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Arc::<str>::from);

        let dashboard_token_hash = config
            .gateway
            .dashboard_token
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|token| Arc::<str>::from(hash_token(token)));

        Ok(Self {
            reconciler: Arc::new(reconciler),
            store,
            webhook_secret,
            dashboard_token_hash,
            rate_limiter: Arc::new(WebhookRateLimiter::per_minute(
                config.gateway.webhook_rate_limit_per_minute,
            )),
        })
    }
}

/// Build the router with middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/webhooks/polar", post(handle_polar_webhook))
        .route("/api/users/{user_id}/credits", get(handle_user_credits))
        .route("/api/users/{user_id}/projects", get(handle_user_projects))
        .route(
            "/api/users/{user_id}/projects/{project_id}",
            delete(handle_project_delete),
        )
        .route("/api/users/{user_id}/stats", get(handle_user_stats))
        .route("/api/products", get(handle_products))
        .route("/api/products/{slug}", get(handle_product_by_slug))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: &Config) -> Result<()> {
    let host = config.gateway.host.as_str();
    let port = config.gateway.port;

    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host}: gateway would be exposed beyond loopback.\n\
             Fix: use --host 127.0.0.1 behind a reverse proxy, or set\n\
             [gateway] allow_public_bind = true in config.toml."
        );
    }

    let store = Arc::new(SqliteStore::open(&config.database.path)?);
    tracing::info!("Database opened at {}", config.database.path.display());

    let state = AppState::new(config, store)?;
    if state.webhook_secret.is_none() {
        tracing::warn!("No Polar webhook secret configured; webhook signatures are NOT verified");
    }
    if state.dashboard_token_hash.is_none() {
        tracing::warn!("No dashboard token configured; dashboard API is unauthenticated");
    }

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("Gateway listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/webhooks/polar: Polar order notifications
async fn handle_polar_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_key = webhook_client(&headers);
    if !state.rate_limiter.check(client_key) {
        tracing::warn!("Polar webhook rate limit exceeded for key: {client_key}");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Too many webhook requests. Please retry later.",
                "retry_after": RATE_LIMIT_WINDOW_SECS,
            })),
        )
            .into_response();
    }

    // ── Signature ──
    if let Some(ref secret) = state.webhook_secret {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let signed = SignedHeaders {
            id: header(HEADER_ID),
            timestamp: header(HEADER_TIMESTAMP),
            signature: header(HEADER_SIGNATURE),
        };
        if let Err(e) = verify_signature(secret, signed, &body, chrono::Utc::now().timestamp()) {
            tracing::warn!("Polar webhook rejected: {e}");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid webhook signature");
        }
    }

    // ── Decode ──
    let event = match decode_event(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Polar webhook JSON parse error: {e}");
            return error_response(StatusCode::BAD_REQUEST, "Invalid webhook payload");
        }
    };

    let order = match event {
        WebhookEvent::OrderPaid(order) => OrderPaid::from(order),
        WebhookEvent::Other(kind) => {
            tracing::debug!(event_type = %kind, "Polar webhook event ignored");
            return Json(serde_json::json!({ "status": "ignored", "type": kind }))
                .into_response();
        }
    };

    // ── Reconcile ──
    match state.reconciler.on_order_paid(&order) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            let status = match e {
                ReconcileError::MissingCustomerReference | ReconcileError::UnknownProduct(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ReconcileError::UserNotFound(_) => StatusCode::NOT_FOUND,
                ReconcileError::Store(_) => {
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to apply credits",
                    );
                }
            };
            error_response(status, &e.to_string())
        }
    }
}

/// Bearer check for dashboard routes. `Err` carries the rejection.
fn authorize_dashboard(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(ref expected) = state.dashboard_token_hash else {
        return Ok(());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(hash_token);

    match presented {
        Some(hash) if constant_time_eq(&hash, expected) => Ok(()),
        _ => {
            tracing::warn!("Dashboard API: rejected request with invalid or missing bearer token");
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: send Authorization: Bearer <dashboard token>",
            ))
        }
    }
}

/// GET /api/users/{user_id}/credits
async fn handle_user_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    if let Err(rejection) = authorize_dashboard(&state, &headers) {
        return rejection;
    }

    match state.store.get_user(&user_id) {
        Ok(Some(user)) => Json(serde_json::json!({
            "userId": user.id,
            "credits": user.credits,
        }))
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "User not found"),
        Err(e) => {
            tracing::error!(user_id = %user_id, "Failed to load user: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load user")
        }
    }
}

/// GET /api/users/{user_id}/projects?search=&sort=
async fn handle_user_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Response {
    if let Err(rejection) = authorize_dashboard(&state, &headers) {
        return rejection;
    }

    match state.store.list_projects(&user_id) {
        Ok(projects) => {
            let projects = apply_query(projects, &query);
            Json(serde_json::json!({
                "count": projects.len(),
                "imageProjects": projects,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, "Failed to list image projects: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list projects")
        }
    }
}

/// DELETE /api/users/{user_id}/projects/{project_id}
async fn handle_project_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Response {
    if let Err(rejection) = authorize_dashboard(&state, &headers) {
        return rejection;
    }

    match state.store.delete_project(&user_id, &project_id) {
        Ok(true) => {
            tracing::info!(user_id = %user_id, project_id = %project_id, "Image project deleted");
            Json(serde_json::json!({ "deleted": true })).into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Project not found"),
        Err(e) => {
            tracing::error!(user_id = %user_id, project_id = %project_id, "Failed to delete image project: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete project")
        }
    }
}

/// GET /api/users/{user_id}/stats
async fn handle_user_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    if let Err(rejection) = authorize_dashboard(&state, &headers) {
        return rejection;
    }

    match state.store.list_projects(&user_id) {
        Ok(projects) => Json(UserStats::compute(&projects, chrono::Utc::now())).into_response(),
        Err(e) => {
            tracing::error!(user_id = %user_id, "Failed to compute user stats: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load stats")
        }
    }
}

/// GET /api/products: credit packs offered at checkout
async fn handle_products(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize_dashboard(&state, &headers) {
        return rejection;
    }

    Json(serde_json::json!({ "products": state.reconciler.catalog().products() })).into_response()
}

/// GET /api/products/{slug}: resolve a checkout slug to its Polar product
async fn handle_product_by_slug(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Response {
    if let Err(rejection) = authorize_dashboard(&state, &headers) {
        return rejection;
    }

    match state.reconciler.catalog().find_by_slug(&slug) {
        Some(product) => Json(product).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown product"),
    }
}
