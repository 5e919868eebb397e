//!
//! qpoints HTTP server
//! -------------------
//! This module defines the Axum-based HTTP API for the qpoints ledger.
//!
//! Responsibilities:
//! - Basic-auth credential extraction (numeric account id + raw secret).
//! - The access gate: every `/api` route resolves its registered route
//!   template to a required permission set and evaluates the caller's mask
//!   before the handler runs.
//! - Balance mutation endpoints delegating to the account store and ledger.
//! - Admin endpoint for credential creation.
//!
//! The gate keys permission lookups on `MatchedPath` (the route template the
//! router actually matched), so overlapping routes cannot alias each other's
//! permission sets.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Extension, Json, Router};
use base64::Engine;
use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::access::{self, Credential, CredentialDirectory, PermissionRegistry};
use crate::accounts::{self, Account, BalanceChange, BulkOp, Platform};
use crate::error::{AppError, AppResult};
use crate::ledger::{self, LedgerEntry};
use crate::store::{SharedStore, Store};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub directory: Arc<CredentialDirectory>,
    pub registry: Arc<PermissionRegistry>,
}

/// Start the qpoints HTTP server with configuration taken from the
/// environment: `QPOINTS_HTTP_PORT`, `QPOINTS_DB_FOLDER`,
/// `QPOINTS_TABLE_PREFIX`.
pub async fn run() -> anyhow::Result<()> {
    let http_port: u16 = std::env::var("QPOINTS_HTTP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let db_folder = std::env::var("QPOINTS_DB_FOLDER").unwrap_or_else(|_| "data".to_string());
    let prefix = std::env::var("QPOINTS_TABLE_PREFIX").unwrap_or_default();
    run_with_config(http_port, &db_folder, &prefix).await
}

pub async fn run_with_config(http_port: u16, db_folder: &str, prefix: &str) -> anyhow::Result<()> {
    let store: SharedStore = Arc::new(Store::open(db_folder, prefix)?);
    // Make sure the reserved counterparty exists before the first transfer
    accounts::system_account(&store)?;

    let state = AppState {
        store,
        directory: Arc::new(CredentialDirectory::new()),
        registry: Arc::new(PermissionRegistry::with_defaults()),
    };
    info!("Permission registry covers {} operations", state.registry.len());

    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Mount all routes. The `/api` subtree carries the access gate as a route
/// layer; everything else is public.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/qpoints/discord/add", patch(bulk_add))
        .route("/api/qpoints/discord/remove", patch(bulk_remove))
        .route("/api/qpoints/discord/set", patch(bulk_set))
        .route("/api/qpoints/discord/transfer/{from}/{to}", patch(transfer_discord))
        .route("/api/qpoints/discord/{user}", get(get_discord))
        .route("/api/qpoints/twitch/add", patch(bulk_add))
        .route("/api/qpoints/twitch/remove", patch(bulk_remove))
        .route("/api/qpoints/twitch/set", patch(bulk_set))
        .route("/api/qpoints/twitch/transfer/{from}/{to}", patch(transfer_twitch))
        .route("/api/qpoints/twitch/{user}", get(get_twitch))
        .route("/api/qpoints/link/{twitch}/{discord}", patch(link))
        .route("/api/qpoints/top10", get(top10))
        .route("/api/qpoints/all-users", get(all_users))
        .route("/api/qpoints", delete(reset))
        .route("/api/admin/keys", post(create_key))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_access));

    Router::new()
        .route("/", get(landing))
        .route("/make-coffee", get(make_coffee))
        .route("/make-tea", get(make_tea))
        .merge(api)
        .with_state(state)
}

async fn landing() -> Html<&'static str> {
    Html("<h1>Coming soon!</h1><p>The site is under construction, so <a href='/make-coffee'>grab a coffee</a>!</p>")
}

async fn make_coffee() -> StatusCode { StatusCode::IM_A_TEAPOT }

async fn make_tea() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "I'm a website, not a teapot!")
}

/// Decode `Authorization: Basic` into (account id hint, raw secret).
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (name, secret) = text.split_once(':')?;
    Some((name.to_string(), secret.to_string()))
}

/// Access gate for every `/api` route: validate the presented credential,
/// resolve the matched route template in the permission registry, and
/// evaluate the mask. Missing header, bad credential, unregistered operation
/// and insufficient permissions all fail with the same uniform rejection.
async fn require_access(
    State(state): State<AppState>,
    matched: MatchedPath,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (id_hint, secret) = basic_credentials(request.headers()).ok_or_else(access::no_principal)?;
    let credential = state.directory.validate(&state.store, &id_hint, &secret)?;
    let required = state
        .registry
        .required_for(request.method(), matched.as_str())
        .ok_or_else(access::no_principal)?;
    if !access::is_allowed(credential.permissions, required) {
        return Err(access::no_principal());
    }
    request.extensions_mut().insert(credential);
    Ok(next.run(request).await)
}

/// One entry of a bulk adjustment request. Exactly one of the handles should
/// be present; entries with neither are skipped.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyBalance {
    #[serde(default)]
    twitch_id: Option<String>,
    #[serde(default)]
    discord_id: Option<String>,
    to_transfer: i64,
}

#[derive(Debug, Clone, Copy)]
enum BulkAction {
    Add,
    Remove,
    Set,
}

fn to_ops(body: Vec<ModifyBalance>, action: BulkAction) -> Vec<BulkOp> {
    body.into_iter()
        .filter_map(|entry| {
            let (platform, handle) = if let Some(t) = entry.twitch_id {
                (Platform::Twitch, t)
            } else if let Some(d) = entry.discord_id {
                (Platform::Discord, d)
            } else {
                return None;
            };
            let change = match action {
                BulkAction::Add => BalanceChange::Add(entry.to_transfer),
                BulkAction::Remove => BalanceChange::Remove(entry.to_transfer),
                BulkAction::Set => BalanceChange::Set(entry.to_transfer),
            };
            Some(BulkOp { platform, handle, change })
        })
        .collect()
}

fn apply_bulk(state: &AppState, body: Vec<ModifyBalance>, action: BulkAction) -> AppResult<Json<Vec<Account>>> {
    let ops = to_ops(body, action);
    Ok(Json(accounts::bulk_apply(&state.store, &ops)?))
}

async fn bulk_add(State(state): State<AppState>, Json(body): Json<Vec<ModifyBalance>>) -> AppResult<Json<Vec<Account>>> {
    apply_bulk(&state, body, BulkAction::Add)
}

async fn bulk_remove(State(state): State<AppState>, Json(body): Json<Vec<ModifyBalance>>) -> AppResult<Json<Vec<Account>>> {
    apply_bulk(&state, body, BulkAction::Remove)
}

async fn bulk_set(State(state): State<AppState>, Json(body): Json<Vec<ModifyBalance>>) -> AppResult<Json<Vec<Account>>> {
    apply_bulk(&state, body, BulkAction::Set)
}

#[derive(Debug, Deserialize)]
struct TransferQuery {
    qpoints: i64,
}

fn transfer_between(state: &AppState, platform: Platform, from: &str, to: &str, amount: i64) -> AppResult<Json<Vec<Account>>> {
    let source = accounts::resolve(&state.store, platform, from)?;
    let dest = accounts::resolve(&state.store, platform, to)?;
    ledger::transfer(&state.store, source.id, dest.id, amount, Some("transfer between two accounts"))?;
    let out = vec![
        accounts::resolve_by_id(&state.store, source.id)?,
        accounts::resolve_by_id(&state.store, dest.id)?,
    ];
    Ok(Json(out))
}

async fn transfer_discord(
    State(state): State<AppState>,
    Path((from, to)): Path<(String, String)>,
    Query(q): Query<TransferQuery>,
) -> AppResult<Json<Vec<Account>>> {
    transfer_between(&state, Platform::Discord, &from, &to, q.qpoints)
}

async fn transfer_twitch(
    State(state): State<AppState>,
    Path((from, to)): Path<(String, String)>,
    Query(q): Query<TransferQuery>,
) -> AppResult<Json<Vec<Account>>> {
    transfer_between(&state, Platform::Twitch, &from, &to, q.qpoints)
}

/// Account plus its ledger activity since the start of the current month.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountActivity {
    #[serde(flatten)]
    account: Account,
    transactions: Vec<LedgerEntry>,
}

fn current_month_start_ms() -> i64 {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

fn account_with_activity(state: &AppState, platform: Platform, handle: &str) -> AppResult<Json<AccountActivity>> {
    let account = accounts::resolve(&state.store, platform, handle)?;
    let transactions = ledger::entries_for(&state.store, account.id, current_month_start_ms())?;
    Ok(Json(AccountActivity { account, transactions }))
}

async fn get_discord(State(state): State<AppState>, Path(user): Path<String>) -> AppResult<Json<AccountActivity>> {
    account_with_activity(&state, Platform::Discord, &user)
}

async fn get_twitch(State(state): State<AppState>, Path(user): Path<String>) -> AppResult<Json<AccountActivity>> {
    account_with_activity(&state, Platform::Twitch, &user)
}

async fn link(
    State(state): State<AppState>,
    Path((twitch, discord)): Path<(String, String)>,
) -> AppResult<Json<Account>> {
    Ok(Json(accounts::link_platforms(&state.store, &twitch, &discord)?))
}

async fn top10(State(state): State<AppState>) -> AppResult<Json<Vec<Account>>> {
    Ok(Json(accounts::list_top(&state.store, 10)?))
}

async fn all_users(State(state): State<AppState>) -> AppResult<Json<Vec<Account>>> {
    Ok(Json(accounts::list_all(&state.store)?))
}

async fn reset(State(state): State<AppState>) -> AppResult<StatusCode> {
    let zeroed = accounts::reset_all(&state.store)?;
    info!("reset balances on {} accounts", zeroed);
    Ok(StatusCode::OK)
}

/// Request body for credential creation: target account id, raw secret, and
/// the permission mask to grant.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewKey {
    user: i64,
    key: String,
    permissions: u32,
}

async fn create_key(
    State(state): State<AppState>,
    Extension(caller): Extension<Credential>,
    Json(body): Json<NewKey>,
) -> AppResult<StatusCode> {
    let perms = access::permissions_in(body.permissions);
    let created = state.directory.create(&state.store, body.user, &body.key, &perms)?;
    info!(
        "access key {} created by account {} for account {}",
        created.id, caller.linked_account, body.user
    );
    Ok(StatusCode::OK)
}
