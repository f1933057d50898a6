use portledger_core::{
    AnnotationRecord, EventKind, FactRecord, PlanSummary, PortKey, PortState, Protocol, RiskLevel, TimelineEvent,
};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::Serialize;
use time::OffsetDateTime;

pub type FactId = i64;
pub type EventId = i64;

/// What one reconciliation cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub host_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub observed: usize,
    #[serde(flatten)]
    pub summary: PlanSummary,
    pub events_written: usize,
}

pub fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_ms(ms: i64) -> Result<OffsetDateTime, time::error::ComponentRange> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
}

pub(crate) fn count_to_sql(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn conversion(idx: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let ms: i64 = row.get(idx)?;
    from_ms(ms).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn protocol_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Protocol> {
    let s: String = row.get(idx)?;
    Protocol::parse(&s).ok_or_else(|| conversion(idx, Type::Text, format!("unexpected protocol {s:?}")))
}

pub(crate) const FACT_COLUMNS: &str = "fact_id, host_id, protocol, port, first_seen_ms, last_seen_ms, \
     last_disappeared_ms, state, pid, process_name, cmdline, total_seen_count, total_uptime_seconds";

pub(crate) fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<FactRecord> {
    let state: String = row.get(7)?;
    let last_disappeared_at = match row.get::<_, Option<i64>>(6)? {
        Some(_) => Some(ts_col(row, 6)?),
        None => None,
    };
    Ok(FactRecord {
        id: row.get(0)?,
        key: PortKey { host_id: row.get(1)?, protocol: protocol_col(row, 2)?, port: row.get(3)? },
        first_seen_at: ts_col(row, 4)?,
        last_seen_at: ts_col(row, 5)?,
        last_disappeared_at,
        state: PortState::parse(&state).ok_or_else(|| conversion(7, Type::Text, format!("unexpected state {state:?}")))?,
        pid: row.get(8)?,
        process_name: row.get(9)?,
        cmdline: row.get(10)?,
        total_seen_count: row.get::<_, i64>(11)?.max(0) as u64,
        total_uptime_seconds: row.get(12)?,
    })
}

pub(crate) const EVENT_COLUMNS: &str = "event_id, fact_id, kind, at_ms, pid, process_name, detail";

pub(crate) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<TimelineEvent> {
    let kind: String = row.get(2)?;
    Ok(TimelineEvent {
        id: row.get(0)?,
        fact_id: row.get(1)?,
        kind: EventKind::parse(&kind).ok_or_else(|| conversion(2, Type::Text, format!("unexpected event kind {kind:?}")))?,
        timestamp: ts_col(row, 3)?,
        pid: row.get(4)?,
        process_name: row.get(5)?,
        output: row.get(6)?,
    })
}

pub(crate) const NOTE_COLUMNS: &str =
    "note_id, host_id, protocol, port, title, description, owner, risk_level, is_pinned";

pub(crate) fn note_from_row(row: &Row<'_>) -> rusqlite::Result<AnnotationRecord> {
    let risk: String = row.get(7)?;
    Ok(AnnotationRecord {
        id: row.get(0)?,
        key: PortKey { host_id: row.get(1)?, protocol: protocol_col(row, 2)?, port: row.get(3)? },
        title: row.get(4)?,
        description: row.get(5)?,
        owner: row.get(6)?,
        risk_level: RiskLevel::parse(&risk).ok_or_else(|| conversion(7, Type::Text, format!("unexpected risk level {risk:?}")))?,
        is_pinned: row.get::<_, i64>(8)? != 0,
    })
}

pub(crate) fn latest_from_row(row: &Row<'_>) -> rusqlite::Result<portledger_core::LatestEvent> {
    let kind: String = row.get(1)?;
    Ok(portledger_core::LatestEvent {
        fact_id: row.get(0)?,
        kind: EventKind::parse(&kind).ok_or_else(|| conversion(1, Type::Text, format!("unexpected event kind {kind:?}")))?,
        at: ts_col(row, 2)?,
    })
}
