use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tollgate_contracts::AuditKind;
use tracing::info;

use crate::audit::AuditLedger;
use crate::error::{require_non_empty, GateError};
use crate::store::{
    load_json, save_json, KvStore, KEY_GUARDRAIL_DENIED, KEY_GUARDRAIL_PATTERNS,
};

pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &["rm -rf", "drop table", "format /", "shutdown"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailDenial {
    ActionDenied(String),
    BlockedPattern(String),
}

impl GuardrailDenial {
    pub fn code(&self) -> &'static str {
        match self {
            GuardrailDenial::ActionDenied(_) => "policy_action_denied",
            GuardrailDenial::BlockedPattern(_) => "policy_blocked_pattern",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            GuardrailDenial::ActionDenied(id) => format!("policy blocked action: {id}"),
            GuardrailDenial::BlockedPattern(p) => format!("policy blocked input pattern: {p}"),
        }
    }
}

struct GuardrailState {
    denied: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

pub struct PolicyGuardrail {
    store: Arc<dyn KvStore>,
    ledger: Arc<AuditLedger>,
    state: RwLock<GuardrailState>,
}

impl PolicyGuardrail {
    pub fn load(store: Arc<dyn KvStore>, ledger: Arc<AuditLedger>) -> Result<Self, GateError> {
        let denied: BTreeSet<String> =
            load_json::<Vec<String>>(store.as_ref(), KEY_GUARDRAIL_DENIED)?
                .unwrap_or_default()
                .into_iter()
                .collect();
        let patterns = load_json::<Vec<String>>(store.as_ref(), KEY_GUARDRAIL_PATTERNS)?
            .map(|v| v.into_iter().collect())
            .unwrap_or_else(default_patterns);
        Ok(Self {
            store,
            ledger,
            state: RwLock::new(GuardrailState { denied, patterns }),
        })
    }

    pub fn evaluate(&self, action_id: &str, input: Option<&str>) -> Option<GuardrailDenial> {
        let state = self.state.read();
        if state.denied.contains(action_id) {
            return Some(GuardrailDenial::ActionDenied(action_id.to_string()));
        }
        let lowered = input?.to_lowercase();
        state
            .patterns
            .iter()
            .find(|p| lowered.contains(p.as_str()))
            .map(|p| GuardrailDenial::BlockedPattern(p.clone()))
    }

    pub fn deny_action(&self, action_id: &str, actor: Option<&str>) -> Result<bool, GateError> {
        require_non_empty("action_id", action_id)?;
        let action_id = action_id.trim();
        let mut state = self.state.write();
        if state.denied.contains(action_id) {
            return Ok(false);
        }
        let mut next = state.denied.clone();
        next.insert(action_id.to_string());
        self.persist_denied(&next)?;
        state.denied = next;
        self.audit_change(action_id, actor, "action denied")?;
        Ok(true)
    }

    pub fn allow_action(&self, action_id: &str, actor: Option<&str>) -> Result<bool, GateError> {
        require_non_empty("action_id", action_id)?;
        let action_id = action_id.trim();
        let mut state = self.state.write();
        if !state.denied.contains(action_id) {
            return Ok(false);
        }
        let mut next = state.denied.clone();
        next.remove(action_id);
        self.persist_denied(&next)?;
        state.denied = next;
        self.audit_change(action_id, actor, "action allowed")?;
        Ok(true)
    }

    pub fn add_pattern(&self, pattern: &str, actor: Option<&str>) -> Result<bool, GateError> {
        require_non_empty("pattern", pattern)?;
        let pattern = pattern.trim().to_lowercase();
        let mut state = self.state.write();
        if state.patterns.contains(&pattern) {
            return Ok(false);
        }
        let mut next = state.patterns.clone();
        next.insert(pattern.clone());
        self.persist_patterns(&next)?;
        state.patterns = next;
        self.audit_change("guardrail", actor, &format!("pattern added: {pattern}"))?;
        Ok(true)
    }

    pub fn remove_pattern(&self, pattern: &str, actor: Option<&str>) -> Result<bool, GateError> {
        require_non_empty("pattern", pattern)?;
        let pattern = pattern.trim().to_lowercase();
        let mut state = self.state.write();
        if !state.patterns.contains(&pattern) {
            return Ok(false);
        }
        let mut next = state.patterns.clone();
        next.remove(&pattern);
        self.persist_patterns(&next)?;
        state.patterns = next;
        self.audit_change("guardrail", actor, &format!("pattern removed: {pattern}"))?;
        Ok(true)
    }

    /// Drops the stored pattern list so the built-in defaults apply again.
    pub fn reset_patterns(&self, actor: Option<&str>) -> Result<(), GateError> {
        let mut state = self.state.write();
        self.store.delete(KEY_GUARDRAIL_PATTERNS)?;
        state.patterns = default_patterns();
        self.audit_change("guardrail", actor, "patterns reset to defaults")
    }

    pub fn denied_actions(&self) -> Vec<String> {
        self.state.read().denied.iter().cloned().collect()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.state.read().patterns.iter().cloned().collect()
    }

    fn persist_denied(&self, denied: &BTreeSet<String>) -> Result<(), GateError> {
        let listed: Vec<&String> = denied.iter().collect();
        save_json(self.store.as_ref(), KEY_GUARDRAIL_DENIED, &listed)?;
        Ok(())
    }

    fn persist_patterns(&self, patterns: &BTreeSet<String>) -> Result<(), GateError> {
        let listed: Vec<&String> = patterns.iter().collect();
        save_json(self.store.as_ref(), KEY_GUARDRAIL_PATTERNS, &listed)?;
        Ok(())
    }

    fn audit_change(&self, subject: &str, actor: Option<&str>, detail: &str) -> Result<(), GateError> {
        info!(subject, detail, "guardrail policy changed");
        self.ledger
            .append(Utc::now(), subject, AuditKind::PolicyChanged, actor, detail)?;
        Ok(())
    }
}

fn default_patterns() -> BTreeSet<String> {
    DEFAULT_BLOCKED_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}
