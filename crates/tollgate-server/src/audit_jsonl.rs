use std::fs::{File, OpenOptions};
use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tollgate_contracts::{AuditEvent, AuditKind};
use tollgate_kernel::hash::jcs_sha256_hex;
use tollgate_kernel::AuditSink;

#[derive(Serialize, Deserialize, Clone)]
struct AuditRecord {
    audit_id: String,
    seq: u64,
    at: String,
    subject: String,
    kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor: Option<String>,
    detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    record_hash: String,
}

impl AuditRecord {
    fn from_event(event: &AuditEvent, prev_hash: Option<String>) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            seq: event.seq,
            at: event.at.to_rfc3339(),
            subject: event.subject.clone(),
            kind: event.kind,
            actor: event.actor.clone(),
            detail: event.detail.clone(),
            prev_hash,
            record_hash: String::new(),
        }
    }

    fn compute_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

struct Files {
    primary: File,
    mirror: Option<File>,
    last_hash: Option<String>,
}

pub struct JsonlAuditSink {
    files: Mutex<Files>,
}

impl JsonlAuditSink {
    pub fn open(path: &str, immutable_mirror_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| v.get("record_hash")?.as_str().map(str::to_string))
            })
        });
        let mirror = match immutable_mirror_path {
            Some(p) if !p.trim().is_empty() => Some(open_append(p)?),
            _ => None,
        };
        Ok(Self {
            files: Mutex::new(Files {
                primary: open_append(path)?,
                mirror,
                last_hash,
            }),
        })
    }
}

fn open_append(path: &str) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("open {path} failed: {e}"))
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), String> {
        let mut files = self.files.lock();
        let mut rec = AuditRecord::from_event(event, files.last_hash.clone());
        rec.record_hash = rec.compute_hash()?;
        let mut line = serde_json::to_string(&rec).map_err(|e| e.to_string())?;
        line.push('\n');

        files
            .primary
            .write_all(line.as_bytes())
            .map_err(|e| format!("audit write failed: {e}"))?;
        if let Some(mirror) = files.mirror.as_mut() {
            mirror
                .write_all(line.as_bytes())
                .map_err(|e| format!("audit mirror write failed: {e}"))?;
        }
        files.last_hash = Some(rec.record_hash);
        Ok(())
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected = rec
            .compute_hash()
            .map_err(|e| format!("line {} hash failed: {e}", idx + 1))?;
        if rec.record_hash != expected {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

pub fn verify_audit_chain_with_mirror(path: &str, mirror: Option<&str>) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    let Some(mirror) = mirror else {
        return Ok(summary);
    };
    verify_audit_chain(mirror).map_err(|e| format!("mirror: {e}"))?;

    let primary = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let copy = std::fs::read_to_string(mirror).map_err(|e| e.to_string())?;
    let a: Vec<&str> = primary.lines().filter(|l| !l.trim().is_empty()).collect();
    let b: Vec<&str> = copy.lines().filter(|l| !l.trim().is_empty()).collect();
    if a.len() != b.len() {
        return Err(format!(
            "mirror length mismatch: primary {} records, mirror {}",
            a.len(),
            b.len()
        ));
    }
    if let Some(idx) = a.iter().zip(&b).position(|(x, y)| x != y) {
        return Err(format!("mirror diverges at line {}", idx + 1));
    }
    Ok(format!("{summary}; mirror identical"))
}
