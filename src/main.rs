mod backfill;
mod config;
mod http;
mod jobs;
mod leads;
mod mautic;
mod metrics;
mod models;
mod resolver;
mod security;
mod settings;
mod shop;
mod store;
mod tagger;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodRouter, get, post},
};
use backfill::{BackfillScheduler, SyncState};
use chrono::{DateTime, Utc};
use config::{
    ADMIN_API_KEY, BACKFILL_BATCH_SIZE, BACKFILL_INTERVAL_SECS, PORT, REDIS_URL, SETTINGS_FILE,
};
use jobs::BackfillRunner;
use leads::{LeadOutcome, LeadService};
use mautic::{ContactsApi, MauticClient, TokenProvider};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CheckoutEvent, LeadRequest, OptinMonsterRequest, OrderEvent, WpJson};
use security::{AdminAuth, RateLimiter, rate_limit, require_admin};
use serde::Serialize;
use serde_json::{Value, json};
use settings::{CheckoutOptin, Settings, SettingsUpdate};
use shop::{ShopError, WooClient};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{KeyValueStore, MemoryStore, RedisStore, StoreError};
use tagger::{OrderTagger, TagOutcome};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, reload};

const NAMESPACE: &str = "/sync-mautic/v1";
const INVALID_EMAIL: &str = "You must enter a valid email.";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "mautic_sync.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    let log = init_tracing();

    let store: Arc<dyn KeyValueStore> = match REDIS_URL.as_deref() {
        Some(url) => Arc::new(RedisStore::open(url, "sync_mautic")?),
        None => {
            warn!(target = "mautic_sync.api", "REDIS_URL not set; state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    let current = settings::bootstrap(store.as_ref(), SETTINGS_FILE.as_deref()).await?;
    log.set_debug(current.debug_mode);
    if !current.is_configured() {
        warn!(
            target = "mautic_sync.api",
            "sync is idle until the Mautic url and credentials are configured"
        );
    }

    let mautic = MauticClient::new(store.clone());
    let api: Arc<dyn ContactsApi> = Arc::new(mautic.clone());
    let tagger = match WooClient::from_env() {
        Some(woo) => Some(OrderTagger::new(Arc::new(woo), api.clone(), store.clone())),
        None => {
            info!(
                target = "mautic_sync.api",
                "WooCommerce credentials not set; order tagging is off"
            );
            None
        }
    };
    let runner = tagger.clone().map(|tagger| {
        let scheduler = BackfillScheduler::new(tagger, store.clone(), *BACKFILL_BATCH_SIZE);
        BackfillRunner::new(
            Arc::new(scheduler),
            Duration::from_secs(*BACKFILL_INTERVAL_SECS),
        )
    });
    if let Some(runner) = &runner {
        runner.arm_if_pending(current.tagging_enabled()).await?;
    }

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    let legacy_routes = settings::has_legacy_settings(store.as_ref()).await;
    let state = AppState {
        store,
        tokens: mautic.tokens().clone(),
        leads: LeadService::new(api),
        tagger,
        runner,
        admin: AdminAuth::new(ADMIN_API_KEY.clone()),
        limiter: RateLimiter::from_env(),
        log,
        prometheus: Some(prometheus),
    };
    let app = build_router(state, legacy_routes);

    let addr: SocketAddr = ([0, 0, 0, 0], *PORT).into();
    info!(target = "mautic_sync.api", legacy_routes, "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(target = "mautic_sync.api", "shutting down");
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn KeyValueStore>,
    tokens: TokenProvider,
    leads: LeadService,
    tagger: Option<OrderTagger>,
    runner: Option<BackfillRunner>,
    admin: AdminAuth,
    limiter: RateLimiter,
    log: LogSwitch,
    prometheus: Option<PrometheusHandle>,
}

fn build_router(state: AppState, legacy_routes: bool) -> Router {
    let mut public = Router::new();
    public = with_slash(public, &format!("{NAMESPACE}/add-lead"), post(add_lead));
    public = with_slash(public, &format!("{NAMESPACE}/optinmonster"), post(optinmonster));
    public = with_slash(public, &format!("{NAMESPACE}/checkout"), post(checkout));
    public = with_slash(
        public,
        &format!("{NAMESPACE}/order-completed"),
        post(order_completed),
    );
    if legacy_routes {
        public = with_slash(public, "/mautic/v1/add-lead", post(optinmonster));
        public = with_slash(public, "/newsletter/v1/add-lead", post(add_lead));
    }
    let public =
        public.route_layer(middleware::from_fn_with_state(state.limiter.clone(), rate_limit));

    let admin = Router::new()
        .route("/admin/settings", get(get_settings).put(put_settings))
        .route("/admin/resync", post(resync))
        .route("/admin/sync-status", get(sync_status))
        .route_layer(middleware::from_fn_with_state(state.admin.clone(), require_admin));

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route(&format!("{NAMESPACE}/checkout-optin"), get(checkout_optin))
        .merge(public)
        .merge(admin)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(config::body_limit()))
}

/// Registers `path` with and without the trailing slash storefront scripts use.
fn with_slash(
    router: Router<AppState>,
    path: &str,
    handler: MethodRouter<AppState>,
) -> Router<AppState> {
    router
        .route(path, handler.clone())
        .route(&format!("{path}/"), handler)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "mautic-sync-rs",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Custom form submission.
///
/// - Method: `POST`
/// - Path: `/sync-mautic/v1/add-lead/`
/// - Body: `{ email, tag }`
/// - Response: `{ success, data }` with the upstream status on success
async fn add_lead(
    State(state): State<AppState>,
    payload: Result<Json<LeadRequest>, JsonRejection>,
) -> Response {
    crate::metrics::inc_requests("add-lead");
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    let tags = request.tag.into_iter().collect();
    submit_lead(&state, "form", request.email.as_deref().unwrap_or_default(), tags).await
}

/// OptinMonster webhook. An empty email is acknowledged without a lead.
async fn optinmonster(
    State(state): State<AppState>,
    payload: Result<Json<OptinMonsterRequest>, JsonRejection>,
) -> Response {
    crate::metrics::inc_requests("optinmonster");
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    let email = request.lead.email.unwrap_or_default();
    if email.trim().is_empty() {
        return (StatusCode::OK, Json(Value::Null)).into_response();
    }
    submit_lead(&state, "optinmonster", &email, request.lead_options.tags).await
}

async fn submit_lead(
    state: &AppState,
    source: &'static str,
    raw_email: &str,
    tags: Vec<String>,
) -> Response {
    let Some(email) = leads::sanitize_email(raw_email) else {
        return (StatusCode::BAD_REQUEST, Json(WpJson::error(INVALID_EMAIL))).into_response();
    };
    lead_response(state.leads.add_lead(source, &email, tags).await)
}

fn lead_response(outcome: LeadOutcome) -> Response {
    match outcome {
        LeadOutcome::Added { status } => {
            (upstream_status(status), Json(WpJson::success("Added lead"))).into_response()
        }
        LeadOutcome::Rejected { status } => (
            upstream_status(status),
            Json(WpJson::error("Failed to add lead")),
        )
            .into_response(),
        LeadOutcome::Unavailable { .. } => {
            (StatusCode::BAD_REQUEST, Json(WpJson::error("Bad Request"))).into_response()
        }
    }
}

fn upstream_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Live completion hook: tag the buyer of one order.
async fn order_completed(
    State(state): State<AppState>,
    payload: Result<Json<OrderEvent>, JsonRejection>,
) -> Result<Json<TagOutcome>, AppError> {
    crate::metrics::inc_requests("order-completed");
    let tagger = state.tagger.as_ref().ok_or(AppError::ShopUnavailable)?;
    let Some(order_id) = payload.ok().and_then(|Json(event)| event.id) else {
        return Err(AppError::InvalidInput("order_id", "Provide id or order_id"));
    };
    Ok(Json(tagger.tag(order_id).await))
}

async fn checkout_optin(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let current = settings::load(state.store.as_ref()).await?;
    Ok(Json(json!({
        "enabled": current.checkout_optin.is_enabled(),
        "checked": current.checkout_optin == CheckoutOptin::Checked,
    })))
}

/// Checkout opt-in: subscribe the order's billing email with the shop tag.
async fn checkout(
    State(state): State<AppState>,
    payload: Result<Json<CheckoutEvent>, JsonRejection>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("checkout");
    let current = settings::load(state.store.as_ref()).await?;
    if !current.checkout_optin.is_enabled() {
        return Err(AppError::NotFound("checkout_optin_disabled"));
    }
    let Ok(Json(event)) = payload else {
        return Err(AppError::InvalidInput(
            "order_id",
            "Provide order_id and newsletter_signup",
        ));
    };
    if !models::is_truthy(&event.newsletter_signup) {
        return Ok(Json(WpJson::success("Not subscribed")).into_response());
    }
    let tagger = state.tagger.as_ref().ok_or(AppError::ShopUnavailable)?;
    let order = tagger
        .orders()
        .order(event.order_id)
        .await?
        .ok_or(AppError::NotFound("order_not_found"))?;
    let Some(email) = leads::sanitize_email(&order.billing_email) else {
        return Ok((StatusCode::BAD_REQUEST, Json(WpJson::error(INVALID_EMAIL))).into_response());
    };
    Ok(lead_response(
        state
            .leads
            .add_checkout_lead(&email, &order.billing_first_name, &order.billing_last_name)
            .await,
    ))
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, AppError> {
    Ok(Json(settings::load(state.store.as_ref()).await?.redacted()))
}

#[derive(Debug, Serialize)]
struct SettingsResponse {
    settings: Settings,
    warnings: Vec<String>,
    resync_started: bool,
}

async fn put_settings(
    State(state): State<AppState>,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> Result<Json<SettingsResponse>, AppError> {
    let Ok(Json(update)) = payload else {
        return Err(AppError::InvalidInput("settings", "Body must be a settings object"));
    };
    let previous = settings::load(state.store.as_ref()).await?;
    let sanitized = settings::sanitize(update, &previous);
    for warning in &sanitized.warnings {
        warn!(target = "mautic_sync.settings", "{warning}");
    }
    let next = sanitized.settings;
    settings::save(state.store.as_ref(), &next).await?;

    if (&next.base_url, &next.client_id, &next.client_secret)
        != (&previous.base_url, &previous.client_id, &previous.client_secret)
        && let Err(err) = state.tokens.forget().await
    {
        warn!(target = "mautic_sync.settings", error = %err, "failed to drop cached token");
    }
    state.log.set_debug(next.debug_mode);

    let mut resync_started = false;
    if let Some(runner) = &state.runner {
        if !next.tagging_enabled() {
            runner.cancel().await;
        } else if sanitized.resync_requested {
            runner.resync().await?;
            resync_started = true;
        } else {
            runner.arm_if_pending(true).await?;
        }
    }
    info!(target = "mautic_sync.settings", resync_started, "settings saved");

    Ok(Json(SettingsResponse {
        settings: next.redacted(),
        warnings: sanitized.warnings,
        resync_started,
    }))
}

#[derive(Debug, Serialize)]
struct SyncStatus {
    state: &'static str,
    processed_count: u64,
    total_count: u64,
    start_time: Option<DateTime<Utc>>,
    armed: bool,
    message: String,
}

async fn describe_sync(runner: &BackfillRunner) -> Result<SyncStatus, StoreError> {
    let armed = runner.is_armed().await;
    Ok(match runner.scheduler().state().await? {
        SyncState::NotStarted => SyncStatus {
            state: "not_started",
            processed_count: 0,
            total_count: 0,
            start_time: None,
            armed,
            message: "Past orders have not been synced yet.".into(),
        },
        SyncState::Running(cursor) => SyncStatus {
            state: "running",
            processed_count: cursor.processed_count,
            total_count: cursor.total_count,
            start_time: Some(cursor.start_time),
            armed,
            message: format!(
                "Sync Mautic has synced {} out of {} orders.",
                cursor.processed_count, cursor.total_count
            ),
        },
        SyncState::Complete => SyncStatus {
            state: "complete",
            processed_count: 0,
            total_count: 0,
            start_time: None,
            armed,
            message: "All past orders are synced.".into(),
        },
    })
}

async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    let runner = state.runner.as_ref().ok_or(AppError::ShopUnavailable)?;
    Ok(Json(describe_sync(runner).await?))
}

async fn resync(State(state): State<AppState>) -> Result<(StatusCode, Json<SyncStatus>), AppError> {
    let runner = state.runner.as_ref().ok_or(AppError::ShopUnavailable)?;
    runner.resync().await?;
    Ok((StatusCode::ACCEPTED, Json(describe_sync(runner).await?)))
}

#[derive(Debug)]
enum AppError {
    Store(StoreError),
    Shop(ShopError),
    ShopUnavailable,
    NotFound(&'static str),
    InvalidInput(&'static str, &'static str),
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ShopError> for AppError {
    fn from(value: ShopError) -> Self {
        Self::Shop(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Store(err) => {
                error!(target = "mautic_sync.api", error = %err, "store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_unavailable",
                    Some(err.to_string()),
                )
            }
            AppError::Shop(err) => {
                error!(target = "mautic_sync.api", error = %err, "shop request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "shop_request_failed",
                    Some(err.to_string()),
                )
            }
            AppError::ShopUnavailable => (
                StatusCode::NOT_FOUND,
                "shop_not_configured",
                Some("Set WOO_BASE_URL, WOO_CONSUMER_KEY and WOO_CONSUMER_SECRET".to_string()),
            ),
            AppError::NotFound(code) => (StatusCode::NOT_FOUND, code, None),
            AppError::InvalidInput(code, detail) => {
                (StatusCode::BAD_REQUEST, code, Some(detail.to_string()))
            }
        };
        let payload = ApiError {
            error: code.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}

/// Raises this crate's log targets to `debug` while the `debug_mode`
/// setting is on.
#[derive(Clone)]
struct LogSwitch(Arc<dyn Fn(bool) + Send + Sync>);

impl LogSwitch {
    #[cfg(test)]
    fn disabled() -> Self {
        Self(Arc::new(|_| {}))
    }

    fn set_debug(&self, on: bool) {
        (self.0)(on)
    }
}

/// Prefix of both the module paths and the `mautic_sync.*` target names.
const DEBUG_TARGET: &str = "mautic_sync";

fn log_directives(base: &str, debug: bool) -> String {
    if debug {
        format!("{base},{DEBUG_TARGET}=debug")
    } else {
        base.to_string()
    }
}

fn log_switch<S: 'static>(handle: reload::Handle<EnvFilter, S>, base: String) -> LogSwitch {
    LogSwitch(Arc::new(move |on| {
        if let Err(err) = handle.reload(EnvFilter::new(log_directives(&base, on))) {
            warn!(target = "mautic_sync.api", error = %err, "failed to switch log level");
        }
    }))
}

fn init_tracing() -> LogSwitch {
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".to_string());
    let builder = fmt()
        .with_env_filter(EnvFilter::new(&base))
        .with_filter_reloading();
    let handle = builder.reload_handle();
    let _ = builder.try_init();
    log_switch(handle, base)
}
