// Lock order: per-target entry, then global history.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tollgate_contracts::{AuditKind, RateSnapshot, SendMode};
use tracing::{debug, info};

use crate::audit::AuditLedger;
use crate::error::{require_non_empty, GateError};
use crate::store::{load_json, save_json, KvStore, KEY_RATE_LIMIT_MODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub min_gap: Duration,
    pub max_per_key: usize,
    pub max_global: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::hours(1),
            min_gap: Duration::seconds(60),
            max_per_key: 5,
            max_global: 20,
        }
    }
}

pub const MAX_WINDOW_DAYS: i64 = 365;

impl RateLimitConfig {
    fn validate(&self) -> Result<(), GateError> {
        if self.window <= Duration::zero() {
            return Err(GateError::InvalidInput("rate window must be positive".to_string()));
        }
        if self.window > Duration::days(MAX_WINDOW_DAYS) {
            return Err(GateError::InvalidInput(format!(
                "rate window must not exceed {MAX_WINDOW_DAYS} days"
            )));
        }
        if self.min_gap < Duration::zero() || self.min_gap > self.window {
            return Err(GateError::InvalidInput(
                "rate min_gap must be between zero and the window".to_string(),
            ));
        }
        if self.max_per_key == 0 || self.max_global == 0 {
            return Err(GateError::InvalidInput("rate caps must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDenial {
    Disabled,
    ReplyOnly,
    Cooldown,
    PerKeyCap,
    GlobalCap,
}

impl RateDenial {
    pub fn code(self) -> &'static str {
        match self {
            RateDenial::Disabled => "rate_disabled",
            RateDenial::ReplyOnly => "rate_reply_only",
            RateDenial::Cooldown => "rate_cooldown",
            RateDenial::PerKeyCap => "rate_per_key_cap",
            RateDenial::GlobalCap => "rate_global_cap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    Allow,
    Deny {
        denial: RateDenial,
        retry_after: Option<Duration>,
        detail: String,
    },
}

impl SendDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SendDecision::Allow)
    }

    fn deny(denial: RateDenial, retry_after: Option<Duration>, detail: String) -> Self {
        SendDecision::Deny {
            denial,
            retry_after,
            detail,
        }
    }
}

#[derive(Debug, Default)]
struct KeyHistory {
    sends: VecDeque<DateTime<Utc>>,
    last_send: Option<DateTime<Utc>>,
}

impl KeyHistory {
    fn in_window(&self, cutoff: DateTime<Utc>) -> impl Iterator<Item = &DateTime<Utc>> {
        self.sends.iter().filter(move |t| **t > cutoff)
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.sends.retain(|t| *t > cutoff);
    }
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    store: Arc<dyn KvStore>,
    ledger: Arc<AuditLedger>,
    mode: RwLock<SendMode>,
    per_key: DashMap<String, KeyHistory>,
    global: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn load(
        cfg: RateLimitConfig,
        store: Arc<dyn KvStore>,
        ledger: Arc<AuditLedger>,
    ) -> Result<Self, GateError> {
        cfg.validate()?;
        let mode: SendMode = load_json(store.as_ref(), KEY_RATE_LIMIT_MODE)?.unwrap_or_default();
        debug!(?mode, "rate limiter loaded");
        Ok(Self {
            cfg,
            store,
            ledger,
            mode: RwLock::new(mode),
            per_key: DashMap::new(),
            global: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> RateLimitConfig {
        self.cfg
    }

    pub fn mode(&self) -> SendMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: SendMode, actor: Option<&str>) -> Result<(), GateError> {
        let mut current = self.mode.write();
        if *current == mode {
            return Ok(());
        }
        save_json(self.store.as_ref(), KEY_RATE_LIMIT_MODE, &mode)?;
        let previous = *current;
        *current = mode;
        info!(?previous, ?mode, "rate limit mode changed");
        self.ledger.append(
            Utc::now(),
            "rate_limit",
            AuditKind::ModeChanged,
            actor,
            format!("{previous:?} -> {mode:?}"),
        )?;
        Ok(())
    }

    pub fn evaluate_send(&self, target: &str, is_reply: bool, now: DateTime<Utc>) -> SendDecision {
        match self.mode() {
            SendMode::Unrestricted => SendDecision::Allow,
            SendMode::Disabled => SendDecision::deny(
                RateDenial::Disabled,
                None,
                "outbound sends are disabled".to_string(),
            ),
            SendMode::ReplyOnly if is_reply => SendDecision::Allow,
            SendMode::ReplyOnly => SendDecision::deny(
                RateDenial::ReplyOnly,
                None,
                "only replies may be sent".to_string(),
            ),
            SendMode::RateLimited if is_reply => SendDecision::Allow,
            SendMode::RateLimited => self.evaluate_windowed(target, now),
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.cfg.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn retry_after(&self, oldest: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        oldest
            .checked_add_signed(self.cfg.window)
            .map(|expires| expires - now)
    }

    fn evaluate_windowed(&self, target: &str, now: DateTime<Utc>) -> SendDecision {
        let cutoff = self.cutoff(now);
        let history = self.per_key.get(target);

        if let Some(h) = history.as_deref() {
            if let Some(last) = h.last_send {
                let ready_at = last.checked_add_signed(self.cfg.min_gap).unwrap_or(last);
                if now < ready_at {
                    let remaining = ready_at - now;
                    return SendDecision::deny(
                        RateDenial::Cooldown,
                        Some(remaining),
                        format!(
                            "cooldown active for {target}: {}ms remaining",
                            remaining.num_milliseconds()
                        ),
                    );
                }
            }
            let count = h.in_window(cutoff).count();
            if count >= self.cfg.max_per_key {
                let retry = h
                    .in_window(cutoff)
                    .min()
                    .and_then(|t| self.retry_after(*t, now));
                return SendDecision::deny(
                    RateDenial::PerKeyCap,
                    retry,
                    format!(
                        "{target} reached {count}/{} sends in window",
                        self.cfg.max_per_key
                    ),
                );
            }
        }

        let global = self.global.lock();
        let count = global.iter().filter(|t| **t > cutoff).count();
        if count >= self.cfg.max_global {
            let retry = global
                .iter()
                .filter(|t| **t > cutoff)
                .min()
                .and_then(|t| self.retry_after(*t, now));
            return SendDecision::deny(
                RateDenial::GlobalCap,
                retry,
                format!("global cap reached: {count}/{} sends in window", self.cfg.max_global),
            );
        }
        SendDecision::Allow
    }

    pub fn record_send(&self, target: &str, now: DateTime<Utc>) -> Result<(), GateError> {
        require_non_empty("target", target)?;
        let cutoff = self.cutoff(now);
        {
            let mut history = self.per_key.entry(target.to_string()).or_default();
            let mut global = self.global.lock();
            history.sends.push_back(now);
            history.last_send = Some(history.last_send.map_or(now, |last| last.max(now)));
            history.prune(cutoff);
            global.push_back(now);
            global.retain(|t| *t > cutoff);
        }
        self.prune(now);
        debug!(target, "send recorded");
        Ok(())
    }

    /// Drops expired entries everywhere and forgets targets with no live sends.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = self.cutoff(now);
        self.per_key.retain(|_, h| {
            h.prune(cutoff);
            !h.sends.is_empty()
        });
        self.global.lock().retain(|t| *t > cutoff);
    }

    pub fn snapshot(&self, target: &str, now: DateTime<Utc>) -> RateSnapshot {
        let cutoff = self.cutoff(now);
        let (key_count, last_send_at) = match self.per_key.get(target) {
            Some(h) => (h.in_window(cutoff).count(), h.last_send),
            None => (0, None),
        };
        let global_count = self.global.lock().iter().filter(|t| **t > cutoff).count();
        RateSnapshot {
            target: target.to_string(),
            mode: self.mode(),
            key_count,
            global_count,
            last_send_at,
        }
    }

    pub fn tracked_targets(&self) -> usize {
        self.per_key.len()
    }
}
