use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Pending,
    Granted,
    Denied,
    Revoked,
}

impl ConsentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentStatus::Pending => "pending",
            ConsentStatus::Granted => "granted",
            ConsentStatus::Denied => "denied",
            ConsentStatus::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConsentRecord {
    pub id: String,
    pub action: String,
    pub status: ConsentStatus,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a consent lookup. `status` is `None` when the action was never requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsentCheck {
    pub action: String,
    pub status: Option<ConsentStatus>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Requested,
    Granted,
    Denied,
    Revoked,
    Engaged,
    Disengaged,
    DisengageFailed,
    AuthChanged,
    GateDenied,
    RateDenied,
    IntegritySignal,
    SensitiveConfigured,
    FreedomChanged,
    SelfCheck,
    ModeChanged,
    PolicyChanged,
    SendCommitted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuditEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub subject: String,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    Disabled,
    ReplyOnly,
    RateLimited,
    #[default]
    Unrestricted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    KillSwitch,
    Autonomy,
    Guardrail,
    Consent,
    RateLimit,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::KillSwitch => "kill_switch",
            Stage::Autonomy => "autonomy",
            Stage::Guardrail => "guardrail",
            Stage::Consent => "consent",
            Stage::RateLimit => "rate_limit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub code: String,
    pub reason: String,
    pub detail: String,
    pub requires_self_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActionRequest {
    pub actor_id: String,
    pub action_key: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub input: Option<String>,
}

impl ActionRequest {
    pub fn new(actor_id: impl Into<String>, action_key: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            action_key: action_key.into(),
            target: None,
            is_reply: false,
            input: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn as_reply(mut self) -> Self {
        self.is_reply = true;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Key used for send-history bookkeeping: the explicit target, else the action key.
    pub fn target_key(&self) -> &str {
        match self.target.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => &self.action_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillSwitchStatus {
    pub engaged: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engaged_at: Option<DateTime<Utc>>,
    pub custom_auth_code: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutonomyDecision {
    pub allowed: bool,
    pub requires_self_check: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelfCheckReport {
    pub ok: bool,
    pub flagged: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateSnapshot {
    pub target: String,
    pub mode: SendMode,
    pub key_count: usize,
    pub global_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_send_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_key_falls_back_to_action_key() {
        let req = ActionRequest::new("agent", "telegram_send");
        assert_eq!(req.target_key(), "telegram_send");

        let req = req.with_target("chat-42");
        assert_eq!(req.target_key(), "chat-42");

        let blank = ActionRequest::new("agent", "telegram_send").with_target("  ");
        assert_eq!(blank.target_key(), "telegram_send");
    }

    #[test]
    fn action_request_rejects_unknown_fields() {
        let raw = json!({"actor_id": "a", "action_key": "b", "priority": 3});
        assert!(serde_json::from_value::<ActionRequest>(raw).is_err());
    }

    #[test]
    fn action_request_defaults_optional_fields() {
        let req: ActionRequest =
            serde_json::from_value(json!({"actor_id": "a", "action_key": "b"})).unwrap();
        assert!(!req.is_reply);
        assert!(req.target.is_none());
        assert!(req.input.is_none());
    }

    #[test]
    fn send_mode_defaults_to_unrestricted() {
        assert_eq!(SendMode::default(), SendMode::Unrestricted);
        assert_eq!(
            serde_json::to_value(SendMode::RateLimited).unwrap(),
            json!("rate_limited")
        );
    }

    #[test]
    fn verdict_omits_empty_optionals() {
        let verdict = Verdict {
            allowed: true,
            stage: None,
            code: "allow".to_string(),
            reason: String::new(),
            detail: String::new(),
            requires_self_check: false,
            retry_after_ms: None,
        };
        let value = serde_json::to_value(&verdict).unwrap();
        assert!(value.get("stage").is_none());
        assert!(value.get("retry_after_ms").is_none());
    }
}
