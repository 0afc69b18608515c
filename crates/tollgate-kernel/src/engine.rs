//! Stage order: kill switch, autonomy, guardrail, consent, rate limit.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tollgate_contracts::{ActionRequest, AuditKind, ConsentStatus, Stage, Verdict};
use tracing::{debug, error, warn};

use crate::audit::{AuditLedger, AuditSink};
use crate::autonomy::AutonomyRegistry;
use crate::consent::ConsentStore;
use crate::error::{require_non_empty, GateError};
use crate::guardrail::PolicyGuardrail;
use crate::kill_switch::KillSwitch;
use crate::rate_limit::{RateLimitConfig, RateLimiter, SendDecision};
use crate::store::KvStore;

#[derive(Debug, Clone, Default)]
pub struct GateSettings {
    pub consent_required: BTreeSet<String>,
    pub outbound_actions: BTreeSet<String>,
}

pub struct EngineOptions {
    pub settings: GateSettings,
    pub rate_limit: RateLimitConfig,
    pub default_sensitive: Vec<String>,
    pub audit_max_events: usize,
    pub audit_sinks: Vec<Arc<dyn AuditSink>>,
}

pub struct Guards {
    pub ledger: Arc<AuditLedger>,
    pub kill_switch: Arc<KillSwitch>,
    pub autonomy: Arc<AutonomyRegistry>,
    pub guardrail: Arc<PolicyGuardrail>,
    pub consent: Arc<ConsentStore>,
    pub rate_limiter: Arc<RateLimiter>,
}

#[derive(Debug)]
pub enum Dispatch<T, E> {
    Denied(Verdict),
    Completed(Result<T, E>),
}

pub struct GateEngine {
    settings: GateSettings,
    guards: Guards,
}

struct Denial {
    stage: Stage,
    code: String,
    reason: String,
    detail: String,
    retry_after_ms: Option<i64>,
}

impl GateEngine {
    pub fn new(settings: GateSettings, guards: Guards) -> Self {
        Self { settings, guards }
    }

    pub fn open(store: Arc<dyn KvStore>, options: EngineOptions) -> Result<Self, GateError> {
        let mut ledger = AuditLedger::load(store.clone(), options.audit_max_events)?;
        for sink in options.audit_sinks {
            ledger = ledger.with_sink(sink);
        }
        let ledger = Arc::new(ledger);
        let guards = Guards {
            kill_switch: Arc::new(KillSwitch::load(store.clone(), ledger.clone())?),
            autonomy: Arc::new(AutonomyRegistry::load(
                store.clone(),
                ledger.clone(),
                &options.default_sensitive,
            )?),
            guardrail: Arc::new(PolicyGuardrail::load(store.clone(), ledger.clone())?),
            consent: Arc::new(ConsentStore::load(store.clone(), ledger.clone())?),
            rate_limiter: Arc::new(RateLimiter::load(
                options.rate_limit,
                store,
                ledger.clone(),
            )?),
            ledger,
        };
        Ok(Self::new(options.settings, guards))
    }

    pub fn evaluate(&self, req: &ActionRequest, now: DateTime<Utc>) -> Result<Verdict, GateError> {
        let req = &normalized(req)?;

        if let Some(reason) = self.guards.kill_switch.check() {
            return self.deny(
                req,
                now,
                false,
                Denial {
                    stage: Stage::KillSwitch,
                    code: "kill_switch_engaged".to_string(),
                    reason,
                    detail: String::new(),
                    retry_after_ms: None,
                },
            );
        }

        let autonomy = self.guards.autonomy.evaluate(&req.action_key);
        if !autonomy.allowed {
            return self.deny(
                req,
                now,
                true,
                Denial {
                    stage: Stage::Autonomy,
                    code: "autonomy_denied".to_string(),
                    reason: autonomy.reason,
                    detail: String::new(),
                    retry_after_ms: None,
                },
            );
        }
        let warning = autonomy
            .requires_self_check
            .then(|| format!("warning: {}", autonomy.reason));
        let self_check = autonomy.requires_self_check;

        if let Some(denial) = self
            .guards
            .guardrail
            .evaluate(&req.action_key, req.input.as_deref())
        {
            return self.deny(
                req,
                now,
                self_check,
                Denial {
                    stage: Stage::Guardrail,
                    code: denial.code().to_string(),
                    reason: denial.reason(),
                    detail: warning.unwrap_or_default(),
                    retry_after_ms: None,
                },
            );
        }

        if self.requires_consent(&req.action_key) {
            let status = self.guards.consent.check(&req.action_key);
            if status != Some(ConsentStatus::Granted) {
                let (code, reason) = match status {
                    None => (
                        "consent_not_requested".to_string(),
                        format!("consent for {} was never requested", req.action_key),
                    ),
                    Some(s) => (
                        format!("consent_{}", s.as_str()),
                        format!("consent for {} is {}", req.action_key, s.as_str()),
                    ),
                };
                return self.deny(
                    req,
                    now,
                    self_check,
                    Denial {
                        stage: Stage::Consent,
                        code,
                        reason,
                        detail: warning.unwrap_or_default(),
                        retry_after_ms: None,
                    },
                );
            }
        }

        if self.is_outbound(&req.action_key) {
            if let SendDecision::Deny {
                denial,
                retry_after,
                detail,
            } = self
                .guards
                .rate_limiter
                .evaluate_send(req.target_key(), req.is_reply, now)
            {
                return self.deny(
                    req,
                    now,
                    self_check,
                    Denial {
                        stage: Stage::RateLimit,
                        code: denial.code().to_string(),
                        reason: detail,
                        detail: warning.unwrap_or_default(),
                        retry_after_ms: retry_after.map(|d| d.num_milliseconds()),
                    },
                );
            }
        }

        debug!(actor = %req.actor_id, action = %req.action_key, "gate allowed action");
        Ok(Verdict {
            allowed: true,
            stage: None,
            code: "allow".to_string(),
            reason: "all guards passed".to_string(),
            detail: warning.unwrap_or_default(),
            requires_self_check: self_check,
            retry_after_ms: None,
        })
    }

    /// Reports a completed action. Outbound proactive sends consume rate budget.
    pub fn commit(&self, req: &ActionRequest, now: DateTime<Utc>) -> Result<(), GateError> {
        let req = &normalized(req)?;
        if !self.is_outbound(&req.action_key) {
            return Ok(());
        }
        let target = req.target_key();
        if !req.is_reply {
            self.guards.rate_limiter.record_send(target, now)?;
        }
        self.guards.ledger.append(
            now,
            target,
            AuditKind::SendCommitted,
            Some(&req.actor_id),
            format!("action={} reply={}", req.action_key, req.is_reply),
        )?;
        Ok(())
    }

    /// Evaluates, runs `handler` when allowed, and commits only if it succeeded.
    pub fn dispatch<T, E>(
        &self,
        req: &ActionRequest,
        now: DateTime<Utc>,
        handler: impl FnOnce() -> Result<T, E>,
    ) -> Result<Dispatch<T, E>, GateError> {
        let verdict = self.evaluate(req, now)?;
        if !verdict.allowed {
            return Ok(Dispatch::Denied(verdict));
        }
        let outcome = handler();
        if outcome.is_ok() {
            if let Err(err) = self.commit(req, now) {
                error!(action = %req.action_key, error = %err, "commit after completed action failed");
            }
        }
        Ok(Dispatch::Completed(outcome))
    }

    pub fn requires_consent(&self, action_key: &str) -> bool {
        self.settings.consent_required.contains(action_key)
    }

    pub fn is_outbound(&self, action_key: &str) -> bool {
        self.settings.outbound_actions.contains(action_key)
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.guards.ledger
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.guards.kill_switch
    }

    pub fn autonomy(&self) -> &Arc<AutonomyRegistry> {
        &self.guards.autonomy
    }

    pub fn guardrail(&self) -> &Arc<PolicyGuardrail> {
        &self.guards.guardrail
    }

    pub fn consent(&self) -> &Arc<ConsentStore> {
        &self.guards.consent
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.guards.rate_limiter
    }

    fn deny(
        &self,
        req: &ActionRequest,
        now: DateTime<Utc>,
        requires_self_check: bool,
        denial: Denial,
    ) -> Result<Verdict, GateError> {
        warn!(
            stage = denial.stage.as_str(),
            code = %denial.code,
            actor = %req.actor_id,
            action = %req.action_key,
            "gate denied action"
        );
        let (kind, subject) = if denial.stage == Stage::RateLimit {
            (AuditKind::RateDenied, req.target_key())
        } else {
            (AuditKind::GateDenied, req.action_key.as_str())
        };
        self.guards.ledger.append(
            now,
            subject,
            kind,
            Some(&req.actor_id),
            format!(
                "stage={} code={} action={} target={} reply={} reason={}",
                denial.stage.as_str(),
                denial.code,
                req.action_key,
                req.target_key(),
                req.is_reply,
                denial.reason
            ),
        )?;
        Ok(Verdict {
            allowed: false,
            stage: Some(denial.stage),
            code: denial.code,
            reason: denial.reason,
            detail: denial.detail,
            requires_self_check,
            retry_after_ms: denial.retry_after_ms,
        })
    }
}

// Ids are matched trimmed, the same way the admin paths store them.
fn normalized(req: &ActionRequest) -> Result<ActionRequest, GateError> {
    require_non_empty("actor_id", &req.actor_id)?;
    require_non_empty("action_key", &req.action_key)?;
    Ok(ActionRequest {
        actor_id: req.actor_id.trim().to_string(),
        action_key: req.action_key.trim().to_string(),
        target: req
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        is_reply: req.is_reply,
        input: req.input.clone(),
    })
}
