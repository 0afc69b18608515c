pub mod audit;
pub mod autonomy;
pub mod command;
pub mod consent;
pub mod engine;
pub mod error;
pub mod guardrail;
pub mod hash;
pub mod kill_switch;
pub mod rate_limit;
pub mod store;

pub use audit::{AuditFilter, AuditLedger, AuditSink};
pub use engine::{Dispatch, EngineOptions, GateEngine, GateSettings, Guards};
pub use error::GateError;
pub use rate_limit::{RateLimitConfig, SendDecision};
pub use store::{KvStore, MemoryKv, StoreError};
