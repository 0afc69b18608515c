use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tollgate_config::Config;
use tollgate_contracts::{
    ActionRequest, AuditEvent, AuditKind, ConsentCheck, ConsentRecord, ErrorBody, ErrorResponse,
    KillSwitchStatus, RateSnapshot, SelfCheckReport, SendMode, Verdict, API_VERSION,
};
use tollgate_kernel::command::{self, CommandOutcome};
use tollgate_kernel::{
    AuditFilter, AuditSink, EngineOptions, GateEngine, GateError, GateSettings, KvStore, MemoryKv,
    RateLimitConfig,
};
use tracing::{error, info};

mod audit_jsonl;
mod sqlite;

pub use audit_jsonl::{verify_audit_chain, verify_audit_chain_with_mirror, JsonlAuditSink};
pub use sqlite::SqliteKv;

const DEFAULT_AUDIT_LIMIT: usize = 50;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "tollgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(&cfg)?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/v1/evaluate", post(evaluate))
        .route("/v1/commit", post(commit))
        .route("/v1/kill-switch", get(kill_switch_status))
        .route("/v1/kill-switch/engage", post(kill_switch_engage))
        .route("/v1/kill-switch/disengage", post(kill_switch_disengage))
        .route("/v1/kill-switch/auth-code", post(kill_switch_auth_code))
        .route("/v1/consent", get(consent_list))
        .route("/v1/consent/actions/{action}", get(consent_check))
        .route("/v1/consent/request", post(consent_request))
        .route("/v1/consent/grant", post(consent_grant))
        .route("/v1/consent/deny", post(consent_deny))
        .route("/v1/consent/revoke", post(consent_revoke))
        .route("/v1/autonomy", get(autonomy_status))
        .route("/v1/autonomy/signal", post(autonomy_signal))
        .route("/v1/autonomy/sensitive", post(autonomy_sensitive))
        .route("/v1/autonomy/freedom", post(autonomy_freedom))
        .route("/v1/autonomy/self-check", post(autonomy_self_check))
        .route("/v1/rate-limit/mode", get(rate_mode).post(set_rate_mode))
        .route("/v1/rate-limit/targets/{target}", get(rate_snapshot))
        .route("/v1/guardrail", get(guardrail_status))
        .route("/v1/guardrail/deny-action", post(guardrail_deny_action))
        .route("/v1/guardrail/allow-action", post(guardrail_allow_action))
        .route("/v1/guardrail/patterns/add", post(guardrail_add_pattern))
        .route("/v1/guardrail/patterns/remove", post(guardrail_remove_pattern))
        .route("/v1/guardrail/patterns/reset", post(guardrail_reset_patterns))
        .route("/v1/audit", get(audit))
        .route("/v1/commands", post(commands))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    engine: Arc<GateEngine>,
}

impl AppState {
    fn new(cfg: &Config) -> Result<Self, String> {
        let store: Arc<dyn KvStore> = match cfg.store.kind.as_str() {
            "sqlite" => {
                let path = cfg
                    .store
                    .sqlite_path
                    .as_deref()
                    .ok_or_else(|| "store.sqlite_path is required when store.type=sqlite".to_string())?;
                Arc::new(SqliteKv::open(path)?)
            }
            _ => Arc::new(MemoryKv::new()),
        };

        let sink: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::open(
            &cfg.audit.jsonl_path,
            cfg.audit.immutable_mirror_path.as_deref(),
        )?);

        let options = EngineOptions {
            settings: GateSettings {
                consent_required: to_set(&cfg.gate.consent_required_actions),
                outbound_actions: to_set(&cfg.gate.outbound_actions),
            },
            rate_limit: RateLimitConfig {
                window: millis("rate_limit.window_ms", cfg.rate_limit.window_ms)?,
                min_gap: millis("rate_limit.min_gap_ms", cfg.rate_limit.min_gap_ms)?,
                max_per_key: cfg.rate_limit.max_per_key,
                max_global: cfg.rate_limit.max_global,
            },
            default_sensitive: cfg.autonomy.default_sensitive_actions.clone(),
            audit_max_events: cfg.audit.max_events,
            audit_sinks: vec![sink],
        };
        let engine = GateEngine::open(store, options).map_err(|e| e.to_string())?;
        info!(
            store = %cfg.store.kind,
            consent_gated = engine.settings().consent_required.len(),
            outbound = engine.settings().outbound_actions.len(),
            "gate engine ready"
        );
        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

fn millis(field: &str, value: u64) -> Result<Duration, String> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_milliseconds)
        .ok_or_else(|| format!("{field} out of range: {value}"))
}

fn to_set(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(err: GateError) -> ApiError {
    let status = match &err {
        GateError::InvalidInput(_) | GateError::InvalidAuthCode(_) => StatusCode::BAD_REQUEST,
        GateError::NotFound(_) => StatusCode::NOT_FOUND,
        GateError::AuthMismatch => StatusCode::FORBIDDEN,
        GateError::StorageUnavailable(_) => {
            error!(error = %err, "durable store unavailable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                details: None,
            },
        }),
    )
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<Value> {
    Json(json!({
        "version": API_VERSION,
        "stages": ["kill_switch", "autonomy", "guardrail", "consent", "rate_limit"],
        "send_modes": ["disabled", "reply_only", "rate_limited", "unrestricted"],
        "consent_statuses": ["pending", "granted", "denied", "revoked"],
        "errors": [
            "validation_error",
            "not_found",
            "auth_mismatch",
            "invalid_auth_code",
            "storage_unavailable"
        ]
    }))
}

async fn evaluate(
    State(state): State<AppState>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<Verdict> {
    state.engine.evaluate(&req, Utc::now()).map(Json).map_err(api_error)
}

async fn commit(
    State(state): State<AppState>,
    Json(req): Json<ActionRequest>,
) -> Result<StatusCode, ApiError> {
    state.engine.commit(&req, Utc::now()).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EngageInput {
    reason: String,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthCodeInput {
    auth_code: String,
    actor: Option<String>,
}

async fn kill_switch_status(State(state): State<AppState>) -> Json<KillSwitchStatus> {
    Json(state.engine.kill_switch().status())
}

async fn kill_switch_engage(
    State(state): State<AppState>,
    Json(input): Json<EngageInput>,
) -> ApiResult<KillSwitchStatus> {
    state
        .engine
        .kill_switch()
        .engage(&input.reason, input.actor.as_deref())
        .map(Json)
        .map_err(api_error)
}

async fn kill_switch_disengage(
    State(state): State<AppState>,
    Json(input): Json<AuthCodeInput>,
) -> ApiResult<KillSwitchStatus> {
    state
        .engine
        .kill_switch()
        .disengage(&input.auth_code, input.actor.as_deref())
        .map(Json)
        .map_err(api_error)
}

async fn kill_switch_auth_code(
    State(state): State<AppState>,
    Json(input): Json<AuthCodeInput>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .kill_switch()
        .set_auth_code(&input.auth_code, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ConsentRequestInput {
    action: String,
    #[serde(default)]
    reason: String,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConsentDecisionInput {
    action: String,
    actor: Option<String>,
}

async fn consent_list(State(state): State<AppState>) -> Json<Vec<ConsentRecord>> {
    Json(state.engine.consent().list())
}

async fn consent_check(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Json<ConsentCheck> {
    let status = state.engine.consent().check(&action);
    Json(ConsentCheck { action, status })
}

async fn consent_request(
    State(state): State<AppState>,
    Json(input): Json<ConsentRequestInput>,
) -> ApiResult<Value> {
    let id = state
        .engine
        .consent()
        .request(&input.action, &input.reason, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "id": id, "action": input.action.trim(), "status": "pending" })))
}

async fn consent_grant(
    State(state): State<AppState>,
    Json(input): Json<ConsentDecisionInput>,
) -> ApiResult<ConsentRecord> {
    state
        .engine
        .consent()
        .grant(&input.action, input.actor.as_deref())
        .map(Json)
        .map_err(api_error)
}

async fn consent_deny(
    State(state): State<AppState>,
    Json(input): Json<ConsentDecisionInput>,
) -> ApiResult<ConsentRecord> {
    state
        .engine
        .consent()
        .deny(&input.action, input.actor.as_deref())
        .map(Json)
        .map_err(api_error)
}

async fn consent_revoke(
    State(state): State<AppState>,
    Json(input): Json<ConsentDecisionInput>,
) -> ApiResult<ConsentRecord> {
    state
        .engine
        .consent()
        .revoke(&input.action, input.actor.as_deref())
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct SignalInput {
    action: String,
    trusted: bool,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SensitiveInput {
    actions: Vec<String>,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FreedomInput {
    enabled: bool,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SelfCheckInput {
    #[serde(default)]
    actions: Vec<String>,
}

async fn autonomy_status(State(state): State<AppState>) -> Json<Value> {
    let autonomy = state.engine.autonomy();
    Json(json!({
        "freedom_of_choice": autonomy.freedom_of_choice(),
        "sensitive": autonomy.sensitive(),
        "tampered": autonomy.tampered(),
    }))
}

async fn autonomy_signal(
    State(state): State<AppState>,
    Json(input): Json<SignalInput>,
) -> ApiResult<Value> {
    let changed = state
        .engine
        .autonomy()
        .report_integrity_signal(&input.action, input.trusted, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "changed": changed })))
}

async fn autonomy_sensitive(
    State(state): State<AppState>,
    Json(input): Json<SensitiveInput>,
) -> ApiResult<Value> {
    let autonomy = state.engine.autonomy();
    autonomy
        .configure_sensitive_actions(&input.actions, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "sensitive": autonomy.sensitive() })))
}

async fn autonomy_freedom(
    State(state): State<AppState>,
    Json(input): Json<FreedomInput>,
) -> ApiResult<Value> {
    state
        .engine
        .autonomy()
        .set_freedom_of_choice(input.enabled, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "freedom_of_choice": input.enabled })))
}

async fn autonomy_self_check(
    State(state): State<AppState>,
    Json(input): Json<SelfCheckInput>,
) -> ApiResult<SelfCheckReport> {
    state
        .engine
        .autonomy()
        .run_self_check(&input.actions)
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct ModeInput {
    mode: SendMode,
    actor: Option<String>,
}

async fn rate_mode(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "mode": state.engine.rate_limiter().mode() }))
}

async fn set_rate_mode(
    State(state): State<AppState>,
    Json(input): Json<ModeInput>,
) -> ApiResult<Value> {
    state
        .engine
        .rate_limiter()
        .set_mode(input.mode, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "mode": input.mode })))
}

async fn rate_snapshot(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Json<RateSnapshot> {
    Json(state.engine.rate_limiter().snapshot(&target, Utc::now()))
}

#[derive(Debug, Deserialize)]
struct GuardrailActionInput {
    action: String,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatternInput {
    pattern: String,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActorInput {
    actor: Option<String>,
}

async fn guardrail_status(State(state): State<AppState>) -> Json<Value> {
    let guardrail = state.engine.guardrail();
    Json(json!({
        "denied_actions": guardrail.denied_actions(),
        "patterns": guardrail.patterns(),
    }))
}

async fn guardrail_deny_action(
    State(state): State<AppState>,
    Json(input): Json<GuardrailActionInput>,
) -> ApiResult<Value> {
    let changed = state
        .engine
        .guardrail()
        .deny_action(&input.action, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "changed": changed })))
}

async fn guardrail_allow_action(
    State(state): State<AppState>,
    Json(input): Json<GuardrailActionInput>,
) -> ApiResult<Value> {
    let changed = state
        .engine
        .guardrail()
        .allow_action(&input.action, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "changed": changed })))
}

async fn guardrail_add_pattern(
    State(state): State<AppState>,
    Json(input): Json<PatternInput>,
) -> ApiResult<Value> {
    let changed = state
        .engine
        .guardrail()
        .add_pattern(&input.pattern, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "changed": changed })))
}

async fn guardrail_remove_pattern(
    State(state): State<AppState>,
    Json(input): Json<PatternInput>,
) -> ApiResult<Value> {
    let changed = state
        .engine
        .guardrail()
        .remove_pattern(&input.pattern, input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "changed": changed })))
}

async fn guardrail_reset_patterns(
    State(state): State<AppState>,
    Json(input): Json<ActorInput>,
) -> ApiResult<Value> {
    let guardrail = state.engine.guardrail();
    guardrail
        .reset_patterns(input.actor.as_deref())
        .map_err(api_error)?;
    Ok(Json(json!({ "patterns": guardrail.patterns() })))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
    subject: Option<String>,
    kind: Option<AuditKind>,
}

async fn audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEvent>> {
    let filter = AuditFilter {
        subject: query.subject,
        kind: query.kind,
        limit: Some(query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT)),
    };
    Json(state.engine.ledger().query(&filter))
}

#[derive(Debug, Deserialize)]
struct CommandInput {
    command: String,
    actor: Option<String>,
}

async fn commands(
    State(state): State<AppState>,
    Json(input): Json<CommandInput>,
) -> ApiResult<CommandOutcome> {
    command::execute_as(
        &state.engine,
        &input.command,
        input.actor.as_deref(),
        Utc::now(),
    )
    .map(Json)
    .map_err(api_error)
}
