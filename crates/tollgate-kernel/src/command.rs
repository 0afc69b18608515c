//! Pipe-delimited admin commands, e.g. `engage|maintenance window`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tollgate_contracts::{AuditKind, SendMode};

use crate::audit::AuditFilter;
use crate::engine::GateEngine;
use crate::error::GateError;

const DEFAULT_AUDIT_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub message: String,
}

impl CommandOutcome {
    fn new(command: &str, message: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

pub fn execute(engine: &GateEngine, line: &str, now: DateTime<Utc>) -> Result<CommandOutcome, GateError> {
    execute_as(engine, line, None, now)
}

pub fn execute_as(
    engine: &GateEngine,
    line: &str,
    actor: Option<&str>,
    now: DateTime<Utc>,
) -> Result<CommandOutcome, GateError> {
    let mut parts = line.split('|').map(str::trim);
    let command = parts.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();
    let cmd = command.as_str();

    let message = match cmd {
        "status" => {
            let ks = engine.kill_switch().status();
            let autonomy = engine.autonomy();
            format!(
                "kill_switch={} mode={} freedom_of_choice={} tampered={} consent_records={}",
                if ks.engaged { "engaged" } else { "clear" },
                mode_label(engine.rate_limiter().mode()),
                autonomy.freedom_of_choice(),
                autonomy.tampered().len(),
                engine.consent().list().len()
            )
        }
        "engage" => {
            let reason = required(cmd, &args, 0, "reason")?;
            let status = engine.kill_switch().engage(reason, actor)?;
            format!("kill switch engaged: {}", status.reason)
        }
        "disengage" => {
            engine
                .kill_switch()
                .disengage(required(cmd, &args, 0, "auth code")?, actor)?;
            "kill switch disengaged".to_string()
        }
        "set_auth_code" => {
            engine
                .kill_switch()
                .set_auth_code(required(cmd, &args, 0, "code")?, actor)?;
            "auth code updated".to_string()
        }
        "request" => {
            let action = required(cmd, &args, 0, "action")?;
            let reason = optional(&args, 1).unwrap_or_default();
            let id = engine.consent().request(action, reason, actor)?;
            format!("consent requested for {action} ({id})")
        }
        "grant" | "deny" | "revoke" => {
            let action = required(cmd, &args, 0, "action")?;
            let consent = engine.consent();
            let record = match cmd {
                "grant" => consent.grant(action, actor)?,
                "deny" => consent.deny(action, actor)?,
                _ => consent.revoke(action, actor)?,
            };
            format!("consent for {} is {}", record.action, record.status.as_str())
        }
        "consent_list" => {
            let records = engine.consent().list();
            if records.is_empty() {
                "no consent records".to_string()
            } else {
                records
                    .iter()
                    .map(|r| format!("{}={}", r.action, r.status.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "set_mode" => {
            let mode = parse_mode(required(cmd, &args, 0, "mode")?)?;
            engine.rate_limiter().set_mode(mode, actor)?;
            format!("send mode set to {}", mode_label(mode))
        }
        "rate" => {
            let snap = engine
                .rate_limiter()
                .snapshot(required(cmd, &args, 0, "target")?, now);
            format!(
                "{}: {} in window, {} global",
                snap.target, snap.key_count, snap.global_count
            )
        }
        "report_signal" => {
            let action = required(cmd, &args, 0, "action")?;
            let trusted = parse_trust(required(cmd, &args, 1, "trusted|untrusted")?)?;
            let changed = engine
                .autonomy()
                .report_integrity_signal(action, trusted, actor)?;
            format!(
                "{action} marked {}{}",
                if trusted { "trusted" } else { "untrusted" },
                if changed { "" } else { " (unchanged)" }
            )
        }
        "configure_sensitive" => {
            let ids = split_list(required(cmd, &args, 0, "comma separated ids")?);
            engine.autonomy().configure_sensitive_actions(&ids, actor)?;
            format!("sensitive actions: {}", ids.join(","))
        }
        "freedom" => {
            let enabled = parse_switch(required(cmd, &args, 0, "on|off")?)?;
            engine.autonomy().set_freedom_of_choice(enabled, actor)?;
            format!("freedom of choice {}", if enabled { "enabled" } else { "disabled" })
        }
        "self_check" => {
            let known = match optional(&args, 0) {
                Some(list) => split_list(list),
                None => known_actions(engine),
            };
            engine.autonomy().run_self_check(&known)?.message
        }
        "deny_action" | "allow_action" => {
            let action = required(cmd, &args, 0, "action")?;
            let guardrail = engine.guardrail();
            let changed = if cmd == "deny_action" {
                guardrail.deny_action(action, actor)?
            } else {
                guardrail.allow_action(action, actor)?
            };
            format!("{cmd} {action}{}", if changed { "" } else { " (unchanged)" })
        }
        "add_pattern" | "remove_pattern" => {
            let pattern = required(cmd, &args, 0, "pattern")?;
            let guardrail = engine.guardrail();
            let changed = if cmd == "add_pattern" {
                guardrail.add_pattern(pattern, actor)?
            } else {
                guardrail.remove_pattern(pattern, actor)?
            };
            format!("{cmd} {pattern}{}", if changed { "" } else { " (unchanged)" })
        }
        "reset_patterns" => {
            engine.guardrail().reset_patterns(actor)?;
            "blocked patterns reset to defaults".to_string()
        }
        "audit" => {
            let limit = match optional(&args, 0) {
                Some(raw) => raw
                    .parse::<usize>()
                    .map_err(|_| GateError::InvalidInput(format!("audit limit must be a number, got {raw:?}")))?,
                None => DEFAULT_AUDIT_LIMIT,
            };
            let filter = AuditFilter {
                subject: optional(&args, 1).map(str::to_string),
                kind: optional(&args, 2).map(parse_kind).transpose()?,
                limit: Some(limit),
            };
            let events = engine.ledger().query(&filter);
            if events.is_empty() {
                "no audit events".to_string()
            } else {
                events
                    .iter()
                    .map(|e| {
                        format!(
                            "#{} {} {} {:?} {}",
                            e.seq,
                            e.at.to_rfc3339(),
                            e.subject,
                            e.kind,
                            e.detail
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "" => return Err(GateError::InvalidInput("empty command".to_string())),
        other => return Err(GateError::InvalidInput(format!("unknown command: {other}"))),
    };

    Ok(CommandOutcome::new(cmd, message))
}

fn optional<'a>(args: &[&'a str], idx: usize) -> Option<&'a str> {
    args.get(idx).copied().filter(|a| !a.is_empty())
}

fn required<'a>(cmd: &str, args: &[&'a str], idx: usize, what: &str) -> Result<&'a str, GateError> {
    optional(args, idx).ok_or_else(|| GateError::InvalidInput(format!("{cmd}: missing {what}")))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn known_actions(engine: &GateEngine) -> Vec<String> {
    let settings = engine.settings();
    let mut ids = engine.autonomy().sensitive();
    ids.extend(settings.consent_required.iter().cloned());
    ids.extend(settings.outbound_actions.iter().cloned());
    ids.sort();
    ids.dedup();
    ids
}

fn parse_mode(raw: &str) -> Result<SendMode, GateError> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| GateError::InvalidInput(format!("unknown send mode: {raw}")))
}

fn parse_kind(raw: &str) -> Result<AuditKind, GateError> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| GateError::InvalidInput(format!("unknown audit kind: {raw}")))
}

fn mode_label(mode: SendMode) -> String {
    serde_json::to_value(mode)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_trust(raw: &str) -> Result<bool, GateError> {
    match raw.to_ascii_lowercase().as_str() {
        "trusted" | "true" | "ok" => Ok(true),
        "untrusted" | "false" | "tampered" => Ok(false),
        other => Err(GateError::InvalidInput(format!("unknown trust signal: {other}"))),
    }
}

fn parse_switch(raw: &str) -> Result<bool, GateError> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "enabled" => Ok(true),
        "off" | "false" | "disabled" => Ok(false),
        other => Err(GateError::InvalidInput(format!("expected on or off, got {other}"))),
    }
}
