//! Global emergency stop. Engaging always succeeds; disengaging needs the auth code.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tollgate_contracts::{AuditKind, KillSwitchStatus};
use tracing::{info, warn};

use crate::audit::AuditLedger;
use crate::error::{require_non_empty, GateError};
use crate::store::{load_json, save_json, KvStore, KEY_KILL_SWITCH};

pub const DEFAULT_AUTH_CODE: &str = "tollgate-reset";
pub const MIN_AUTH_CODE_LEN: usize = 4;
const SUBJECT: &str = "kill_switch";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KillSwitchState {
    engaged: bool,
    reason: String,
    #[serde(default)]
    engaged_at: Option<DateTime<Utc>>,
    auth_code: String,
    custom_auth_code: bool,
}

impl Default for KillSwitchState {
    fn default() -> Self {
        Self {
            engaged: false,
            reason: String::new(),
            engaged_at: None,
            auth_code: DEFAULT_AUTH_CODE.to_string(),
            custom_auth_code: false,
        }
    }
}

impl KillSwitchState {
    fn status(&self) -> KillSwitchStatus {
        KillSwitchStatus {
            engaged: self.engaged,
            reason: self.reason.clone(),
            engaged_at: self.engaged_at,
            custom_auth_code: self.custom_auth_code,
        }
    }
}

pub struct KillSwitch {
    store: Arc<dyn KvStore>,
    ledger: Arc<AuditLedger>,
    state: RwLock<KillSwitchState>,
}

impl KillSwitch {
    pub fn load(store: Arc<dyn KvStore>, ledger: Arc<AuditLedger>) -> Result<Self, GateError> {
        let state: KillSwitchState =
            load_json(store.as_ref(), KEY_KILL_SWITCH)?.unwrap_or_default();
        if !state.custom_auth_code {
            warn!("kill switch is using the built-in auth code; set a custom one");
        }
        if state.engaged {
            warn!(reason = %state.reason, "kill switch restored in engaged state");
        }
        Ok(Self {
            store,
            ledger,
            state: RwLock::new(state),
        })
    }

    pub fn status(&self) -> KillSwitchStatus {
        self.state.read().status()
    }

    /// Side-effect-free poll: `Some(reason)` while engaged.
    pub fn check(&self) -> Option<String> {
        let state = self.state.read();
        state.engaged.then(|| state.reason.clone())
    }

    /// Engages the switch. Re-engaging keeps the original reason.
    pub fn engage(&self, reason: &str, actor: Option<&str>) -> Result<KillSwitchStatus, GateError> {
        require_non_empty("reason", reason)?;
        let mut state = self.state.write();
        if state.engaged {
            return Ok(state.status());
        }

        let now = Utc::now();
        let next = KillSwitchState {
            engaged: true,
            reason: reason.trim().to_string(),
            engaged_at: Some(now),
            ..state.clone()
        };
        save_json(self.store.as_ref(), KEY_KILL_SWITCH, &next)?;
        *state = next;
        info!(reason = %state.reason, "kill switch engaged");
        self.ledger
            .append(now, SUBJECT, AuditKind::Engaged, actor, state.reason.clone())?;
        Ok(state.status())
    }

    pub fn disengage(&self, code: &str, actor: Option<&str>) -> Result<KillSwitchStatus, GateError> {
        let mut state = self.state.write();
        let now = Utc::now();
        if code != state.auth_code {
            warn!("kill switch disengage rejected: auth code mismatch");
            self.ledger.append(
                now,
                SUBJECT,
                AuditKind::DisengageFailed,
                actor,
                "auth code mismatch",
            )?;
            return Err(GateError::AuthMismatch);
        }
        if !state.engaged {
            return Ok(state.status());
        }

        let previous_reason = state.reason.clone();
        let next = KillSwitchState {
            engaged: false,
            reason: String::new(),
            engaged_at: None,
            ..state.clone()
        };
        save_json(self.store.as_ref(), KEY_KILL_SWITCH, &next)?;
        *state = next;
        info!("kill switch disengaged");
        self.ledger.append(
            now,
            SUBJECT,
            AuditKind::Disengaged,
            actor,
            format!("cleared: {previous_reason}"),
        )?;
        Ok(state.status())
    }

    pub fn set_auth_code(&self, code: &str, actor: Option<&str>) -> Result<(), GateError> {
        if code.chars().count() < MIN_AUTH_CODE_LEN {
            return Err(GateError::InvalidAuthCode(format!(
                "must be at least {MIN_AUTH_CODE_LEN} characters"
            )));
        }
        let mut state = self.state.write();
        let next = KillSwitchState {
            auth_code: code.to_string(),
            custom_auth_code: true,
            ..state.clone()
        };
        save_json(self.store.as_ref(), KEY_KILL_SWITCH, &next)?;
        *state = next;
        info!("kill switch auth code changed");
        self.ledger.append(
            Utc::now(),
            SUBJECT,
            AuditKind::AuthChanged,
            actor,
            "auth code updated",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyKv;
    use crate::store::MemoryKv;

    fn fixture() -> (Arc<dyn KvStore>, Arc<AuditLedger>, KillSwitch) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let ledger = Arc::new(AuditLedger::load(store.clone(), 100).unwrap());
        let ks = KillSwitch::load(store.clone(), ledger.clone()).unwrap();
        (store, ledger, ks)
    }

    #[test]
    fn starts_disengaged_with_default_code() {
        let (_, _, ks) = fixture();
        let status = ks.status();
        assert!(!status.engaged);
        assert!(!status.custom_auth_code);
        assert!(ks.check().is_none());
    }

    #[test]
    fn wrong_code_keeps_switch_engaged_and_is_audited() {
        let (_, ledger, ks) = fixture();
        ks.engage("x", None).unwrap();
        let err = ks.disengage("wrong", Some("mallory")).unwrap_err();
        assert!(matches!(err, GateError::AuthMismatch));
        assert!(ks.status().engaged);

        let last = &ledger.recent(1)[0];
        assert_eq!(last.kind, AuditKind::DisengageFailed);
        assert_eq!(last.actor.as_deref(), Some("mallory"));
        assert!(!last.detail.contains(DEFAULT_AUTH_CODE));
    }

    #[test]
    fn correct_code_disengages_and_reengage_resets_reason() {
        let (_, _, ks) = fixture();
        ks.engage("first incident", None).unwrap();
        let status = ks.disengage(DEFAULT_AUTH_CODE, None).unwrap();
        assert!(!status.engaged);
        assert!(status.reason.is_empty());

        let status = ks.engage("second incident", None).unwrap();
        assert!(status.engaged);
        assert_eq!(status.reason, "second incident");
    }

    #[test]
    fn engage_twice_keeps_original_reason() {
        let (_, ledger, ks) = fixture();
        ks.engage("original", None).unwrap();
        let status = ks.engage("replacement", None).unwrap();
        assert_eq!(status.reason, "original");
        assert_eq!(ks.check().as_deref(), Some("original"));
        assert_eq!(
            ledger
                .recent(10)
                .iter()
                .filter(|e| e.kind == AuditKind::Engaged)
                .count(),
            1
        );
    }

    #[test]
    fn engage_requires_reason() {
        let (_, ledger, ks) = fixture();
        let err = ks.engage("   ", None).unwrap_err();
        assert!(matches!(err, GateError::InvalidInput(_)));
        assert!(!ks.status().engaged);
        assert!(ledger.is_empty());
    }

    #[test]
    fn short_auth_code_is_rejected_without_change() {
        let (_, _, ks) = fixture();
        let err = ks.set_auth_code("abc", None).unwrap_err();
        assert!(matches!(err, GateError::InvalidAuthCode(_)));
        assert!(!ks.status().custom_auth_code);

        ks.set_auth_code("abcd", None).unwrap();
        ks.engage("drill", None).unwrap();
        assert!(matches!(
            ks.disengage(DEFAULT_AUTH_CODE, None),
            Err(GateError::AuthMismatch)
        ));
        assert!(!ks.disengage("abcd", None).unwrap().engaged);
    }

    #[test]
    fn state_survives_reload() {
        let (store, ledger, ks) = fixture();
        ks.set_auth_code("s3cret", None).unwrap();
        ks.engage("persisted", None).unwrap();

        let reloaded = KillSwitch::load(store, ledger).unwrap();
        let status = reloaded.status();
        assert!(status.engaged);
        assert_eq!(status.reason, "persisted");
        assert!(status.custom_auth_code);
        assert!(reloaded.disengage("s3cret", None).is_ok());
    }

    #[test]
    fn storage_outage_leaves_state_unchanged() {
        let flaky = Arc::new(FlakyKv::default());
        let store: Arc<dyn KvStore> = flaky.clone();
        let ledger = Arc::new(AuditLedger::load(store.clone(), 10).unwrap());
        let ks = KillSwitch::load(store, ledger).unwrap();

        flaky.set_failing(true);
        let err = ks.engage("outage", None).unwrap_err();
        assert!(matches!(err, GateError::StorageUnavailable(_)));
        assert!(!ks.status().engaged);
    }
}
