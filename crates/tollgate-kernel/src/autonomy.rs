use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tollgate_contracts::{AuditKind, AutonomyDecision, SelfCheckReport};
use tracing::{info, warn};

use crate::audit::AuditLedger;
use crate::error::{require_non_empty, GateError};
use crate::store::{
    load_json, save_json, KvStore, KEY_AUTONOMY_FREEDOM, KEY_AUTONOMY_SENSITIVE,
};

const SUBJECT: &str = "autonomy";

struct TrustState {
    tampered: BTreeSet<String>,
    sensitive: BTreeSet<String>,
    freedom_of_choice: bool,
}

pub struct AutonomyRegistry {
    store: Arc<dyn KvStore>,
    ledger: Arc<AuditLedger>,
    state: RwLock<TrustState>,
}

impl AutonomyRegistry {
    pub fn load(
        store: Arc<dyn KvStore>,
        ledger: Arc<AuditLedger>,
        default_sensitive: &[String],
    ) -> Result<Self, GateError> {
        let sensitive = match load_json::<Vec<String>>(store.as_ref(), KEY_AUTONOMY_SENSITIVE)? {
            Some(ids) => ids.into_iter().collect(),
            None => validate_sensitive(default_sensitive)?,
        };
        let freedom_of_choice =
            load_json::<bool>(store.as_ref(), KEY_AUTONOMY_FREEDOM)?.unwrap_or(true);
        if !freedom_of_choice {
            warn!("autonomy restored in disabled state; all actions will be denied");
        }
        Ok(Self {
            store,
            ledger,
            state: RwLock::new(TrustState {
                tampered: BTreeSet::new(),
                sensitive,
                freedom_of_choice,
            }),
        })
    }

    pub fn evaluate(&self, action_id: &str) -> AutonomyDecision {
        let state = self.state.read();
        if !state.freedom_of_choice {
            return AutonomyDecision {
                allowed: false,
                requires_self_check: true,
                reason: "autonomy disabled by administrator".to_string(),
            };
        }
        if state.tampered.contains(action_id) && state.sensitive.contains(action_id) {
            return AutonomyDecision {
                allowed: false,
                requires_self_check: true,
                reason: format!("untrusted integrity signal for sensitive action {action_id}"),
            };
        }
        if state.tampered.is_empty() {
            AutonomyDecision {
                allowed: true,
                requires_self_check: false,
                reason: "trusted".to_string(),
            }
        } else {
            AutonomyDecision {
                allowed: true,
                requires_self_check: true,
                reason: format!(
                    "{} action(s) carry an untrusted integrity signal; self-check advised",
                    state.tampered.len()
                ),
            }
        }
    }

    /// Returns whether the tampered set changed.
    pub fn report_integrity_signal(
        &self,
        action_id: &str,
        trusted: bool,
        actor: Option<&str>,
    ) -> Result<bool, GateError> {
        require_non_empty("action_id", action_id)?;
        let changed = {
            let mut state = self.state.write();
            if trusted {
                state.tampered.remove(action_id)
            } else {
                state.tampered.insert(action_id.to_string())
            }
        };
        if changed {
            let label = if trusted { "trusted" } else { "untrusted" };
            info!(action = action_id, signal = label, "integrity signal recorded");
            self.ledger.append(
                Utc::now(),
                action_id,
                AuditKind::IntegritySignal,
                actor,
                label,
            )?;
        }
        Ok(changed)
    }

    pub fn configure_sensitive_actions(
        &self,
        ids: &[String],
        actor: Option<&str>,
    ) -> Result<(), GateError> {
        let sensitive = validate_sensitive(ids)?;
        let mut state = self.state.write();
        let listed: Vec<&String> = sensitive.iter().collect();
        save_json(self.store.as_ref(), KEY_AUTONOMY_SENSITIVE, &listed)?;
        let detail = listed
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",");
        state.sensitive = sensitive;
        info!(count = state.sensitive.len(), "sensitive actions configured");
        self.ledger.append(
            Utc::now(),
            SUBJECT,
            AuditKind::SensitiveConfigured,
            actor,
            detail,
        )?;
        Ok(())
    }

    pub fn set_freedom_of_choice(&self, enabled: bool, actor: Option<&str>) -> Result<(), GateError> {
        let mut state = self.state.write();
        if state.freedom_of_choice == enabled {
            return Ok(());
        }
        save_json(self.store.as_ref(), KEY_AUTONOMY_FREEDOM, &enabled)?;
        state.freedom_of_choice = enabled;
        info!(enabled, "autonomy freedom of choice changed");
        self.ledger.append(
            Utc::now(),
            SUBJECT,
            AuditKind::FreedomChanged,
            actor,
            if enabled { "enabled" } else { "disabled" },
        )?;
        Ok(())
    }

    pub fn run_self_check(&self, known_ids: &[String]) -> Result<SelfCheckReport, GateError> {
        let flagged: Vec<String> = {
            let state = self.state.read();
            let mut hits: Vec<String> = known_ids
                .iter()
                .filter(|id| state.tampered.contains(id.as_str()))
                .cloned()
                .collect();
            hits.sort();
            hits.dedup();
            hits
        };
        if flagged.is_empty() {
            return Ok(SelfCheckReport {
                ok: true,
                flagged,
                message: "OK".to_string(),
            });
        }
        let message = format!("untrusted actions: {}", flagged.join(", "));
        warn!(flagged = %message, "self-check found untrusted actions");
        self.ledger
            .append(Utc::now(), SUBJECT, AuditKind::SelfCheck, None, message.clone())?;
        Ok(SelfCheckReport {
            ok: false,
            flagged,
            message,
        })
    }

    pub fn tampered(&self) -> Vec<String> {
        self.state.read().tampered.iter().cloned().collect()
    }

    pub fn sensitive(&self) -> Vec<String> {
        self.state.read().sensitive.iter().cloned().collect()
    }

    pub fn freedom_of_choice(&self) -> bool {
        self.state.read().freedom_of_choice
    }
}

fn validate_sensitive(ids: &[String]) -> Result<BTreeSet<String>, GateError> {
    if ids.is_empty() {
        return Err(GateError::InvalidInput(
            "sensitive action list must not be empty".to_string(),
        ));
    }
    let mut out = BTreeSet::new();
    for id in ids {
        let id = id.trim();
        if id.is_empty() || id.contains('*') {
            return Err(GateError::InvalidInput(format!(
                "sensitive action ids must be explicit, got {id:?}"
            )));
        }
        out.insert(id.to_string());
    }
    Ok(out)
}
