//! Per-action consent ledger. Records are superseded in place, never deleted.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tollgate_contracts::{AuditKind, ConsentRecord, ConsentStatus};
use tracing::info;

use crate::audit::AuditLedger;
use crate::error::{require_non_empty, GateError};
use crate::store::{load_json, save_json, KvStore, KEY_CONSENT_RECORDS};

pub struct ConsentStore {
    store: Arc<dyn KvStore>,
    ledger: Arc<AuditLedger>,
    records: RwLock<Vec<ConsentRecord>>,
}

impl ConsentStore {
    pub fn load(store: Arc<dyn KvStore>, ledger: Arc<AuditLedger>) -> Result<Self, GateError> {
        let records: Vec<ConsentRecord> =
            load_json(store.as_ref(), KEY_CONSENT_RECORDS)?.unwrap_or_default();
        Ok(Self {
            store,
            ledger,
            records: RwLock::new(records),
        })
    }

    /// Creates or resets a pending record and returns its id.
    pub fn request(&self, action: &str, reason: &str, actor: Option<&str>) -> Result<String, GateError> {
        require_non_empty("action", action)?;
        let action = action.trim();
        let now = Utc::now();
        let mut records = self.records.write();
        let mut next = records.clone();

        let id = match next.iter_mut().find(|r| r.action == action) {
            Some(existing) => {
                existing.status = ConsentStatus::Pending;
                existing.reason = reason.to_string();
                existing.requested_at = now;
                existing.updated_at = now;
                existing.id.clone()
            }
            None => {
                let id = format!("consent_{}", uuid::Uuid::new_v4().as_simple());
                next.push(ConsentRecord {
                    id: id.clone(),
                    action: action.to_string(),
                    status: ConsentStatus::Pending,
                    reason: reason.to_string(),
                    requested_at: now,
                    updated_at: now,
                });
                id
            }
        };

        save_json(self.store.as_ref(), KEY_CONSENT_RECORDS, &next)?;
        *records = next;
        info!(action, consent_id = %id, "consent requested");
        self.ledger
            .append(now, action, AuditKind::Requested, actor, reason.to_string())?;
        Ok(id)
    }

    pub fn grant(&self, action: &str, actor: Option<&str>) -> Result<ConsentRecord, GateError> {
        self.transition(action, ConsentStatus::Granted, AuditKind::Granted, actor)
    }

    pub fn deny(&self, action: &str, actor: Option<&str>) -> Result<ConsentRecord, GateError> {
        self.transition(action, ConsentStatus::Denied, AuditKind::Denied, actor)
    }

    pub fn revoke(&self, action: &str, actor: Option<&str>) -> Result<ConsentRecord, GateError> {
        self.transition(action, ConsentStatus::Revoked, AuditKind::Revoked, actor)
    }

    /// `None` when the action was never requested.
    pub fn check(&self, action: &str) -> Option<ConsentStatus> {
        self.records
            .read()
            .iter()
            .find(|r| r.action == action)
            .map(|r| r.status)
    }

    /// Insertion order.
    pub fn list(&self) -> Vec<ConsentRecord> {
        self.records.read().clone()
    }

    fn transition(
        &self,
        action: &str,
        status: ConsentStatus,
        kind: AuditKind,
        actor: Option<&str>,
    ) -> Result<ConsentRecord, GateError> {
        require_non_empty("action", action)?;
        let action = action.trim();
        let now = Utc::now();
        let mut records = self.records.write();
        let mut next = records.clone();
        let record = next
            .iter_mut()
            .find(|r| r.action == action)
            .ok_or_else(|| GateError::NotFound(format!("no consent requested for {action}")))?;
        let previous = record.status;
        record.status = status;
        record.updated_at = now;
        let updated = record.clone();

        save_json(self.store.as_ref(), KEY_CONSENT_RECORDS, &next)?;
        *records = next;
        info!(action, from = previous.as_str(), to = status.as_str(), "consent updated");
        self.ledger.append(
            now,
            action,
            kind,
            actor,
            format!("{} -> {}", previous.as_str(), status.as_str()),
        )?;
        Ok(updated)
    }
}
