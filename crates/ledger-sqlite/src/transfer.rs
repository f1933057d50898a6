//! Bulk export/import in the `{runtimes, notes, events}` JSON shape of older
//! deployments. Field names are kept as they were so old dumps load unchanged.

use crate::models::{count_to_sql, to_ms};
use crate::Db;
use anyhow::{Context, Result};
use portledger_core::{EventKind, LedgerError, PortKey, PortState, RiskLevel, DEFAULT_HOST_ID};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyExport {
    #[serde(default)]
    pub runtimes: Vec<LegacyRuntime>,
    #[serde(default)]
    pub notes: Vec<LegacyNote>,
    #[serde(default)]
    pub events: Vec<LegacyEvent>,
}

fn default_host() -> String {
    DEFAULT_HOST_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRuntime {
    pub id: i64,
    #[serde(default = "default_host")]
    pub host_id: String,
    pub protocol: String,
    pub port: i64,
    #[serde(default)]
    pub first_seen_at: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<String>,
    #[serde(default)]
    pub last_disappeared_at: Option<String>,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub current_pid: Option<i64>,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub total_seen_count: Option<i64>,
    #[serde(default)]
    pub total_uptime_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyNote {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "default_host")]
    pub host_id: String,
    pub protocol: String,
    pub port: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEvent {
    #[serde(default)]
    pub id: i64,
    pub port_runtime_id: i64,
    pub event_type: String,
    pub timestamp: String,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub facts_imported: usize,
    pub facts_skipped: usize,
    pub notes_imported: usize,
    pub notes_skipped: usize,
    pub events_imported: usize,
    pub events_skipped: usize,
}

/// Accepts RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.fraction]` read as UTC.
pub fn parse_legacy_timestamp(raw: &str) -> Result<OffsetDateTime, LedgerError> {
    let raw = raw.trim();
    if let Ok(t) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(t);
    }
    let with_fraction = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let plain = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(raw, with_fraction)
        .or_else(|_| PrimitiveDateTime::parse(raw, plain))
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| LedgerError::validation(format!("unrecognised timestamp {raw:?}")))
}

fn rfc3339(t: OffsetDateTime) -> Result<String> {
    t.format(&Rfc3339).context("failed to format timestamp")
}

fn non_negative_u32(v: Option<i64>) -> u32 {
    v.and_then(|p| u32::try_from(p).ok()).unwrap_or(0)
}

/// A runtime missing one of its two timestamps borrows the other; missing both is an error.
fn runtime_span(r: &LegacyRuntime) -> Result<(OffsetDateTime, OffsetDateTime), LedgerError> {
    let first = r.first_seen_at.as_deref().map(parse_legacy_timestamp).transpose()?;
    let last = r.last_seen_at.as_deref().map(parse_legacy_timestamp).transpose()?;
    match (first, last) {
        (Some(f), Some(l)) => Ok((f, l)),
        (Some(t), None) | (None, Some(t)) => Ok((t, t)),
        (None, None) => Err(LedgerError::validation(format!(
            "runtime {}: neither first_seen_at nor last_seen_at is set",
            r.id
        ))),
    }
}

impl Db {
    pub fn export_legacy(&self) -> Result<LegacyExport> {
        let mut out = LegacyExport::default();
        for f in self.facts(None)? {
            out.runtimes.push(LegacyRuntime {
                id: f.id,
                host_id: f.key.host_id.clone(),
                protocol: f.key.protocol.as_str().to_string(),
                port: i64::from(f.key.port),
                first_seen_at: Some(rfc3339(f.first_seen_at)?),
                last_seen_at: Some(rfc3339(f.last_seen_at)?),
                last_disappeared_at: f.last_disappeared_at.map(rfc3339).transpose()?,
                current_state: Some(f.state.as_str().to_string()),
                current_pid: Some(i64::from(f.pid)),
                process_name: Some(f.process_name),
                cmdline: Some(f.cmdline),
                total_seen_count: Some(count_to_sql(f.total_seen_count)),
                total_uptime_seconds: Some(f.total_uptime_seconds),
            });
        }
        for n in self.annotations(None)? {
            out.notes.push(LegacyNote {
                id: n.id,
                host_id: n.key.host_id,
                protocol: n.key.protocol.as_str().to_string(),
                port: i64::from(n.key.port),
                title: n.title,
                description: n.description,
                owner: n.owner,
                risk_level: Some(n.risk_level.as_str().to_string()),
                is_pinned: Some(n.is_pinned),
            });
        }
        for e in self.all_events()? {
            out.events.push(LegacyEvent {
                id: e.id,
                port_runtime_id: e.fact_id,
                event_type: e.kind.as_str().to_string(),
                timestamp: rfc3339(e.timestamp)?,
                pid: Some(i64::from(e.pid)),
                process_name: Some(e.process_name),
                output: e.output,
            });
        }
        Ok(out)
    }

    /// Loads a dump in one transaction. Tuples that already exist are left alone
    /// (a skipped fact drops its events with it). Any malformed value aborts the lot.
    pub fn import_legacy(&mut self, data: &LegacyExport) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        let tx = self.conn.transaction()?;

        // legacy runtime id -> fact_id in this database
        let mut id_map: HashMap<i64, i64> = HashMap::new();

        for r in &data.runtimes {
            let key = PortKey::parse(&r.host_id, &r.protocol, r.port)?;
            let state = match r.current_state.as_deref() {
                None => PortState::Active,
                Some(s) => PortState::parse(s)
                    .ok_or_else(|| LedgerError::validation(format!("runtime {}: unknown state {s:?}", r.id)))?,
            };
            let (first_seen, last_seen) = runtime_span(r)?;
            let last_disappeared = r.last_disappeared_at.as_deref().map(parse_legacy_timestamp).transpose()?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT fact_id FROM port_fact WHERE host_id=? AND protocol=? AND port=?",
                    params![key.host_id, key.protocol.as_str(), key.port],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                report.facts_skipped += 1;
                continue;
            }

            tx.execute(
                "INSERT INTO port_fact(host_id,protocol,port,first_seen_ms,last_seen_ms,last_disappeared_ms,state,pid,process_name,cmdline,total_seen_count,total_uptime_seconds)
                 VALUES (?,?,?,?,?,?,?,?,?,?,?,?)",
                params![
                    key.host_id,
                    key.protocol.as_str(),
                    key.port,
                    to_ms(first_seen),
                    to_ms(last_seen),
                    last_disappeared.map(to_ms),
                    state.as_str(),
                    non_negative_u32(r.current_pid),
                    r.process_name.as_deref().unwrap_or_default(),
                    r.cmdline.as_deref().unwrap_or_default(),
                    r.total_seen_count.unwrap_or(1).max(0),
                    r.total_uptime_seconds.unwrap_or(0)
                ],
            )?;
            id_map.insert(r.id, tx.last_insert_rowid());
            report.facts_imported += 1;
        }

        for n in &data.notes {
            let key = PortKey::parse(&n.host_id, &n.protocol, n.port)?;
            let risk = match n.risk_level.as_deref() {
                None => RiskLevel::default(),
                Some(s) => s.parse::<RiskLevel>()?,
            };
            let inserted = tx.execute(
                "INSERT INTO port_note(host_id,protocol,port,title,description,owner,risk_level,is_pinned)
                 VALUES (?,?,?,?,?,?,?,?) ON CONFLICT(host_id,protocol,port) DO NOTHING",
                params![
                    key.host_id,
                    key.protocol.as_str(),
                    key.port,
                    n.title,
                    n.description,
                    n.owner,
                    risk.as_str(),
                    n.is_pinned.unwrap_or(false) as i64
                ],
            )?;
            if inserted == 0 {
                report.notes_skipped += 1;
            } else {
                report.notes_imported += 1;
            }
        }

        for e in &data.events {
            let kind = EventKind::parse(&e.event_type)
                .ok_or_else(|| LedgerError::validation(format!("event {}: unknown type {:?}", e.id, e.event_type)))?;
            let at = parse_legacy_timestamp(&e.timestamp)?;
            let Some(fact_id) = id_map.get(&e.port_runtime_id) else {
                report.events_skipped += 1;
                continue;
            };
            tx.execute(
                "INSERT INTO port_event(fact_id,kind,at_ms,pid,process_name,detail) VALUES (?,?,?,?,?,?)",
                params![
                    fact_id,
                    kind.as_str(),
                    to_ms(at),
                    non_negative_u32(e.pid),
                    e.process_name.as_deref().unwrap_or_default(),
                    e.output
                ],
            )?;
            report.events_imported += 1;
        }

        tx.commit()?;
        tracing::info!(
            facts = report.facts_imported,
            notes = report.notes_imported,
            events = report.events_imported,
            skipped_facts = report.facts_skipped,
            skipped_notes = report.notes_skipped,
            "legacy import committed"
        );
        Ok(report)
    }
}
