use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tollgate_contracts::{AuditEvent, AuditKind};
use tracing::{debug, warn};

use crate::error::GateError;
use crate::store::{load_json, save_json, KvStore, KEY_AUDIT_EVENTS};

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), String>;
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub subject: Option<String>,
    pub kind: Option<AuditKind>,
    pub limit: Option<usize>,
}

struct LedgerState {
    events: VecDeque<AuditEvent>,
    next_seq: u64,
}

pub struct AuditLedger {
    store: Arc<dyn KvStore>,
    max_events: usize,
    state: Mutex<LedgerState>,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLedger {
    pub fn load(store: Arc<dyn KvStore>, max_events: usize) -> Result<Self, GateError> {
        if max_events == 0 {
            return Err(GateError::InvalidInput(
                "audit max_events must be >= 1".to_string(),
            ));
        }
        let mut events: VecDeque<AuditEvent> =
            load_json(store.as_ref(), KEY_AUDIT_EVENTS)?.unwrap_or_default();
        while events.len() > max_events {
            events.pop_front();
        }
        let next_seq = events.back().map(|e| e.seq + 1).unwrap_or(1);
        debug!(retained = events.len(), next_seq, "audit ledger loaded");
        Ok(Self {
            store,
            max_events,
            state: Mutex::new(LedgerState { events, next_seq }),
            sinks: Vec::new(),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    // A failed write restores the window and skips the sinks.
    pub fn append(
        &self,
        at: DateTime<Utc>,
        subject: &str,
        kind: AuditKind,
        actor: Option<&str>,
        detail: impl Into<String>,
    ) -> Result<AuditEvent, GateError> {
        let mut state = self.state.lock();
        let event = AuditEvent {
            seq: state.next_seq,
            at,
            subject: subject.to_string(),
            kind,
            actor: actor.map(|v| v.to_string()),
            detail: detail.into(),
        };

        state.events.push_back(event.clone());
        let evicted = if state.events.len() > self.max_events {
            state.events.pop_front()
        } else {
            None
        };

        if let Err(err) = save_json(self.store.as_ref(), KEY_AUDIT_EVENTS, &state.events) {
            state.events.pop_back();
            if let Some(old) = evicted {
                state.events.push_front(old);
            }
            return Err(err.into());
        }
        state.next_seq += 1;

        for sink in &self.sinks {
            if let Err(err) = sink.record(&event) {
                warn!(seq = event.seq, error = %err, "audit sink write failed");
            }
        }
        Ok(event)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        self.state
            .lock()
            .events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let state = self.state.lock();
        state
            .events
            .iter()
            .rev()
            .filter(|e| filter.subject.as_deref().map_or(true, |s| e.subject == s))
            .filter(|e| filter.kind.map_or(true, |k| e.kind == k))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_events
    }
}
