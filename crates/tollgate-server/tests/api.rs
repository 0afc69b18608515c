use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tollgate_config::{default_sensitive_actions, Audit, Autonomy, Config, Gate, RateLimit, Server, Store};
use tollgate_contracts::API_VERSION;
use tollgate_server::{build_app, verify_audit_chain, verify_audit_chain_with_mirror};
use tower::util::ServiceExt;

fn nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos()
}

fn temp_path(tag: &str, ext: &str) -> String {
    std::env::temp_dir()
        .join(format!("tollgate-{tag}-{}.{ext}", nanos()))
        .to_string_lossy()
        .to_string()
}

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        gate: Gate {
            consent_required_actions: vec!["email_send".to_string()],
            outbound_actions: vec!["telegram_send".to_string(), "email_send".to_string()],
        },
        rate_limit: RateLimit::default(),
        autonomy: Autonomy {
            default_sensitive_actions: default_sensitive_actions(),
        },
        audit: Audit {
            max_events: 100,
            jsonl_path: temp_path("audit", "jsonl"),
            immutable_mirror_path: None,
        },
    }
}

fn test_config_sqlite(db_path: &str) -> Config {
    let mut cfg = test_config();
    cfg.store.kind = "sqlite".to_string();
    cfg.store.sqlite_path = Some(db_path.to_string());
    cfg
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

fn send(target: &str) -> Value {
    json!({"actor_id": "agent-1", "action_key": "telegram_send", "target": target})
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config()).await.unwrap();
    let (status, _) = call(&app, "GET", "/v1/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn contracts_endpoint_lists_stages_in_order() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = call(&app, "GET", "/v1/contracts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["version"], API_VERSION);
    assert_eq!(
        payload["stages"],
        json!(["kill_switch", "autonomy", "guardrail", "consent", "rate_limit"])
    );
}

#[tokio::test]
async fn evaluate_allows_plain_action() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = call(
        &app,
        "POST",
        "/v1/evaluate",
        Some(json!({"actor_id": "agent-1", "action_key": "calculator"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["allowed"], true);
    assert_eq!(payload["requires_self_check"], false);
}

#[tokio::test]
async fn evaluate_rejects_missing_actor_with_error_envelope() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = call(
        &app,
        "POST",
        "/v1/evaluate",
        Some(json!({"actor_id": " ", "action_key": "calculator"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "validation_error");
}

#[tokio::test]
async fn kill_switch_blocks_until_disengaged_with_code() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = call(
        &app,
        "POST",
        "/v1/kill-switch/engage",
        Some(json!({"reason": "incident 9", "actor": "ops"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["engaged"], true);
    assert_eq!(payload["custom_auth_code"], false);

    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(send("chatA"))).await;
    assert_eq!(verdict["allowed"], false);
    assert_eq!(verdict["stage"], "kill_switch");
    assert_eq!(verdict["reason"], "incident 9");

    let (status, payload) = call(
        &app,
        "POST",
        "/v1/kill-switch/auth-code",
        Some(json!({"auth_code": "abc"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "invalid_auth_code");

    let (status, _) = call(
        &app,
        "POST",
        "/v1/kill-switch/auth-code",
        Some(json!({"auth_code": "open-sesame"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, payload) = call(
        &app,
        "POST",
        "/v1/kill-switch/disengage",
        Some(json!({"auth_code": "tollgate-reset"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(payload["error"]["code"], "auth_mismatch");

    let (status, payload) = call(
        &app,
        "POST",
        "/v1/kill-switch/disengage",
        Some(json!({"auth_code": "open-sesame"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["engaged"], false);

    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(send("chatA"))).await;
    assert_eq!(verdict["allowed"], true);

    let (_, events) = call(&app, "GET", "/v1/audit?subject=kill_switch", None).await;
    let kinds: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["disengaged", "disengage_failed", "auth_changed", "engaged"]
    );
}

#[tokio::test]
async fn consent_flow_gates_email() {
    let app = build_app(test_config()).await.unwrap();
    let email = json!({"actor_id": "agent-1", "action_key": "email_send", "target": "bob@example.com"});

    let (status, _) = call(
        &app,
        "POST",
        "/v1/consent/grant",
        Some(json!({"action": "email_send"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(email.clone())).await;
    assert_eq!(verdict["stage"], "consent");

    let (status, payload) = call(
        &app,
        "POST",
        "/v1/consent/request",
        Some(json!({"action": "email_send", "reason": "weekly digest"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(payload["id"].as_str().unwrap().starts_with("consent_"));

    let (_, check) = call(&app, "GET", "/v1/consent/actions/email_send", None).await;
    assert_eq!(check["status"], "pending");

    let (status, record) = call(
        &app,
        "POST",
        "/v1/consent/grant",
        Some(json!({"action": "email_send", "actor": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "granted");

    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(email.clone())).await;
    assert_eq!(verdict["allowed"], true);

    call(
        &app,
        "POST",
        "/v1/consent/revoke",
        Some(json!({"action": "email_send"})),
    )
    .await;
    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(email)).await;
    assert_eq!(verdict["code"], "consent_revoked");

    let (_, unknown) = call(&app, "GET", "/v1/consent/actions/never_asked", None).await;
    assert!(unknown.get("status").map_or(true, Value::is_null));
}

#[tokio::test]
async fn tampered_sensitive_action_is_denied_and_self_check_flags_it() {
    let app = build_app(test_config()).await.unwrap();
    call(
        &app,
        "POST",
        "/v1/autonomy/signal",
        Some(json!({"action": "sandbox_exec", "trusted": false})),
    )
    .await;

    let (_, verdict) = call(
        &app,
        "POST",
        "/v1/evaluate",
        Some(json!({"actor_id": "agent-1", "action_key": "sandbox_exec"})),
    )
    .await;
    assert_eq!(verdict["allowed"], false);
    assert_eq!(verdict["stage"], "autonomy");
    assert_eq!(verdict["requires_self_check"], true);

    let (_, verdict) = call(
        &app,
        "POST",
        "/v1/evaluate",
        Some(json!({"actor_id": "agent-1", "action_key": "calculator"})),
    )
    .await;
    assert_eq!(verdict["allowed"], true);
    assert_eq!(verdict["requires_self_check"], true);

    let (_, report) = call(
        &app,
        "POST",
        "/v1/autonomy/self-check",
        Some(json!({"actions": ["calculator", "sandbox_exec"]})),
    )
    .await;
    assert_eq!(report["ok"], false);
    assert_eq!(report["flagged"], json!(["sandbox_exec"]));

    let (status, payload) = call(
        &app,
        "POST",
        "/v1/autonomy/sensitive",
        Some(json!({"actions": ["*"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "validation_error");
}

#[tokio::test]
async fn guardrail_blocks_denied_actions_and_patterns() {
    let app = build_app(test_config()).await.unwrap();
    let (_, verdict) = call(
        &app,
        "POST",
        "/v1/evaluate",
        Some(json!({"actor_id": "agent-1", "action_key": "shell", "input": "sudo rm -rf /"})),
    )
    .await;
    assert_eq!(verdict["stage"], "guardrail");
    assert_eq!(verdict["code"], "policy_blocked_pattern");

    let (_, changed) = call(
        &app,
        "POST",
        "/v1/guardrail/deny-action",
        Some(json!({"action": "web_search"})),
    )
    .await;
    assert_eq!(changed["changed"], true);
    let (_, verdict) = call(
        &app,
        "POST",
        "/v1/evaluate",
        Some(json!({"actor_id": "agent-1", "action_key": "web_search"})),
    )
    .await;
    assert_eq!(verdict["code"], "policy_action_denied");
}

#[tokio::test]
async fn rate_limited_mode_enforces_cooldown_after_commit() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = call(
        &app,
        "POST",
        "/v1/rate-limit/mode",
        Some(json!({"mode": "rate_limited"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["mode"], "rate_limited");

    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(send("chatA"))).await;
    assert_eq!(verdict["allowed"], true);
    let (status, _) = call(&app, "POST", "/v1/commit", Some(send("chatA"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(send("chatA"))).await;
    assert_eq!(verdict["allowed"], false);
    assert_eq!(verdict["stage"], "rate_limit");
    assert_eq!(verdict["code"], "rate_cooldown");
    assert!(verdict["retry_after_ms"].as_i64().unwrap() > 0);

    let reply = json!({"actor_id": "agent-1", "action_key": "telegram_send", "target": "chatA", "is_reply": true});
    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(reply)).await;
    assert_eq!(verdict["allowed"], true);

    let (_, other) = call(&app, "POST", "/v1/evaluate", Some(send("chatB"))).await;
    assert_eq!(other["allowed"], true);

    let (_, snap) = call(&app, "GET", "/v1/rate-limit/targets/chatA", None).await;
    assert_eq!(snap["key_count"], 1);
    assert_eq!(snap["global_count"], 1);

    let (_, denials) = call(&app, "GET", "/v1/audit?kind=rate_denied", None).await;
    assert_eq!(denials[0]["subject"], "chatA");
}

#[tokio::test]
async fn targets_and_actions_named_like_static_routes_are_reachable() {
    let app = build_app(test_config()).await.unwrap();
    call(
        &app,
        "POST",
        "/v1/rate-limit/mode",
        Some(json!({"mode": "rate_limited"})),
    )
    .await;
    let (status, _) = call(&app, "POST", "/v1/commit", Some(send("mode"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, snap) = call(&app, "GET", "/v1/rate-limit/targets/mode", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snap["target"], "mode");
    assert_eq!(snap["key_count"], 1);

    let (status, _) = call(&app, "GET", "/v1/consent/actions/request", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn disabled_mode_denies_replies_too() {
    let app = build_app(test_config()).await.unwrap();
    call(
        &app,
        "POST",
        "/v1/rate-limit/mode",
        Some(json!({"mode": "disabled"})),
    )
    .await;
    let reply = json!({"actor_id": "agent-1", "action_key": "telegram_send", "target": "chatA", "is_reply": true});
    let (_, verdict) = call(&app, "POST", "/v1/evaluate", Some(reply)).await;
    assert_eq!(verdict["code"], "rate_disabled");

    let (_, mode) = call(&app, "GET", "/v1/rate-limit/mode", None).await;
    assert_eq!(mode["mode"], "disabled");
}

#[tokio::test]
async fn commands_endpoint_runs_admin_commands() {
    let app = build_app(test_config()).await.unwrap();
    let (status, outcome) = call(
        &app,
        "POST",
        "/v1/commands",
        Some(json!({"command": "engage|via command", "actor": "ops"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["command"], "engage");

    let (_, ks) = call(&app, "GET", "/v1/kill-switch", None).await;
    assert_eq!(ks["engaged"], true);
    assert_eq!(ks["reason"], "via command");

    let (status, payload) = call(
        &app,
        "POST",
        "/v1/commands",
        Some(json!({"command": "launch|rockets"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "validation_error");
}

#[tokio::test]
async fn sqlite_state_survives_restart() {
    let db_path = temp_path("state", "db");
    {
        let app = build_app(test_config_sqlite(&db_path)).await.unwrap();
        call(
            &app,
            "POST",
            "/v1/kill-switch/engage",
            Some(json!({"reason": "persisted"})),
        )
        .await;
        call(
            &app,
            "POST",
            "/v1/consent/request",
            Some(json!({"action": "email_send"})),
        )
        .await;
        call(
            &app,
            "POST",
            "/v1/rate-limit/mode",
            Some(json!({"mode": "reply_only"})),
        )
        .await;
    }

    let app = build_app(test_config_sqlite(&db_path)).await.unwrap();
    let (_, ks) = call(&app, "GET", "/v1/kill-switch", None).await;
    assert_eq!(ks["engaged"], true);
    assert_eq!(ks["reason"], "persisted");
    let (_, check) = call(&app, "GET", "/v1/consent/actions/email_send", None).await;
    assert_eq!(check["status"], "pending");
    let (_, mode) = call(&app, "GET", "/v1/rate-limit/mode", None).await;
    assert_eq!(mode["mode"], "reply_only");
    let (_, events) = call(&app, "GET", "/v1/audit?limit=10", None).await;
    assert_eq!(events.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn audit_chain_verification_detects_tampering() {
    let cfg = test_config();
    let audit_path = cfg.audit.jsonl_path.clone();
    let app = build_app(cfg).await.unwrap();

    call(
        &app,
        "POST",
        "/v1/kill-switch/engage",
        Some(json!({"reason": "drill"})),
    )
    .await;
    call(&app, "POST", "/v1/evaluate", Some(send("chatA"))).await;

    assert!(verify_audit_chain(&audit_path).is_ok());

    let mut lines: Vec<String> = std::fs::read_to_string(&audit_path)
        .unwrap()
        .lines()
        .map(|line| line.to_string())
        .collect();
    let mut tampered: Value = serde_json::from_str(&lines[1]).unwrap();
    tampered["detail"] = Value::String("nothing to see".to_string());
    lines[1] = serde_json::to_string(&tampered).unwrap();
    std::fs::write(&audit_path, format!("{}\n", lines.join("\n"))).unwrap();

    assert!(verify_audit_chain(&audit_path).is_err());
}

#[tokio::test]
async fn audit_chain_verification_with_mirror_succeeds_when_equal() {
    let mut cfg = test_config();
    let mirror_path = cfg.audit.jsonl_path.clone() + ".mirror";
    cfg.audit.immutable_mirror_path = Some(mirror_path.clone());
    let audit_path = cfg.audit.jsonl_path.clone();

    let app = build_app(cfg).await.unwrap();
    call(
        &app,
        "POST",
        "/v1/guardrail/patterns/add",
        Some(json!({"pattern": "wire transfer"})),
    )
    .await;

    assert!(verify_audit_chain_with_mirror(&audit_path, Some(&mirror_path)).is_ok());
}
