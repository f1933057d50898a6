use crate::model::{
    AnnotationRecord, DerivedStatus, EventKind, FactRecord, PortKey, PortState, Protocol,
};
use crate::status::derive_status;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;

/// Most recent timeline entry of one fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestEvent {
    pub fact_id: i64,
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// One row of the merged listing: fact fields, annotation fields, derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedPortItem {
    pub host_id: String,
    pub protocol: Protocol,
    pub port: u16,

    pub runtime_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_seen_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_disappeared_at: Option<OffsetDateTime>,
    pub current_state: Option<PortState>,
    pub current_pid: Option<u32>,
    pub process_name: Option<String>,
    pub cmdline: Option<String>,
    pub total_seen_count: Option<u64>,
    pub total_uptime_seconds: Option<i64>,
    pub uptime_human: String,

    pub note_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub owner: Option<String>,
    /// `unknown` when the tuple has no annotation.
    pub risk_level: String,
    pub is_pinned: bool,

    pub derived_status: DerivedStatus,
    pub latest_event_type: Option<EventKind>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_event_timestamp: Option<OffsetDateTime>,
}

/// Coarse uptime: `"{d}d {h}h"` past one day, `"{h}h"` below.
pub fn format_uptime(first_seen: OffsetDateTime, now: OffsetDateTime) -> String {
    let delta = (now - first_seen).max(time::Duration::ZERO);
    let days = delta.whole_days();
    let hours = delta.whole_hours() % 24;
    if days > 0 {
        format!("{days}d {hours}h")
    } else {
        format!("{hours}h")
    }
}

/// Joins facts and annotations by tuple. Rows are sorted by (host, protocol, port).
pub fn merge_view(
    facts: &[FactRecord],
    annotations: &[AnnotationRecord],
    latest_events: &[LatestEvent],
    now: OffsetDateTime,
) -> Vec<MergedPortItem> {
    let mut joined: BTreeMap<&PortKey, (Option<&FactRecord>, Option<&AnnotationRecord>)> = BTreeMap::new();
    for f in facts {
        joined.entry(&f.key).or_default().0 = Some(f);
    }
    for a in annotations {
        joined.entry(&a.key).or_default().1 = Some(a);
    }
    let latest: HashMap<i64, &LatestEvent> = latest_events.iter().map(|e| (e.fact_id, e)).collect();

    joined
        .into_iter()
        .map(|(key, (fact, note))| {
            let last = fact.and_then(|f| latest.get(&f.id));
            MergedPortItem {
                host_id: key.host_id.clone(),
                protocol: key.protocol,
                port: key.port,
                runtime_id: fact.map(|f| f.id),
                first_seen_at: fact.map(|f| f.first_seen_at),
                last_seen_at: fact.map(|f| f.last_seen_at),
                last_disappeared_at: fact.and_then(|f| f.last_disappeared_at),
                current_state: fact.map(|f| f.state),
                current_pid: fact.map(|f| f.pid),
                process_name: fact.map(|f| f.process_name.clone()),
                cmdline: fact.map(|f| f.cmdline.clone()),
                total_seen_count: fact.map(|f| f.total_seen_count),
                total_uptime_seconds: fact.map(|f| f.total_uptime_seconds),
                uptime_human: fact
                    .filter(|f| f.is_active())
                    .map(|f| format_uptime(f.first_seen_at, now))
                    .unwrap_or_default(),
                note_id: note.map(|n| n.id),
                title: note.and_then(|n| n.title.clone()),
                description: note.and_then(|n| n.description.clone()),
                owner: note.and_then(|n| n.owner.clone()),
                risk_level: note.map_or("unknown", |n| n.risk_level.as_str()).to_string(),
                is_pinned: note.is_some_and(|n| n.is_pinned),
                derived_status: derive_status(fact, note),
                latest_event_type: last.map(|e| e.kind),
                latest_event_timestamp: last.map(|e| e.at),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;
    use time::Duration;

    fn key(proto: Protocol, port: u16) -> PortKey {
        PortKey::new("local", proto, port).unwrap()
    }

    fn fact(id: i64, k: PortKey, state: PortState) -> FactRecord {
        FactRecord {
            id,
            key: k,
            first_seen_at: OffsetDateTime::UNIX_EPOCH,
            last_seen_at: OffsetDateTime::UNIX_EPOCH,
            last_disappeared_at: None,
            state,
            pid: 1,
            process_name: "svc".into(),
            cmdline: "svc --flag".into(),
            total_seen_count: 1,
            total_uptime_seconds: 0,
        }
    }

    #[test]
    fn uptime_formats_days_and_hours() {
        let start = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(format_uptime(start, start + Duration::minutes(59)), "0h");
        assert_eq!(format_uptime(start, start + Duration::hours(5)), "5h");
        assert_eq!(format_uptime(start, start + Duration::hours(50)), "2d 2h");
        assert_eq!(format_uptime(start + Duration::hours(1), start), "0h");
    }

    #[test]
    fn rows_cover_both_sets_in_tuple_order() {
        let facts = vec![
            fact(1, key(Protocol::Udp, 53), PortState::Active),
            fact(2, key(Protocol::Tcp, 8080), PortState::Disappeared),
        ];
        let mut note = AnnotationRecord::new_default(key(Protocol::Tcp, 22));
        note.risk_level = RiskLevel::Trusted;
        note.title = Some("ssh".into());

        let rows = merge_view(&facts, &[note], &[], OffsetDateTime::UNIX_EPOCH + Duration::hours(3));
        let keys: Vec<_> = rows.iter().map(|r| (r.protocol, r.port)).collect();
        assert_eq!(keys, vec![(Protocol::Tcp, 22), (Protocol::Tcp, 8080), (Protocol::Udp, 53)]);

        assert_eq!(rows[0].derived_status, DerivedStatus::Unknown);
        assert_eq!(rows[0].risk_level, "trusted");
        assert!(rows[0].runtime_id.is_none());

        assert_eq!(rows[1].derived_status, DerivedStatus::Ghost);
        assert_eq!(rows[1].risk_level, "unknown");
        assert_eq!(rows[1].uptime_human, "");

        assert_eq!(rows[2].derived_status, DerivedStatus::Suspicious);
        assert_eq!(rows[2].uptime_human, "3h");
    }

    #[test]
    fn latest_event_is_attached_by_fact_id() {
        let facts = vec![fact(7, key(Protocol::Tcp, 443), PortState::Active)];
        let latest = vec![LatestEvent {
            fact_id: 7,
            kind: EventKind::Acknowledged,
            at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(30),
        }];
        let rows = merge_view(&facts, &[], &latest, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(rows[0].latest_event_type, Some(EventKind::Acknowledged));
        let v = serde_json::to_value(&rows[0]).unwrap();
        assert_eq!(v["latest_event_type"], "acknowledged");
        assert_eq!(v["latest_event_timestamp"], "1970-01-01T00:00:30Z");
        assert_eq!(v["derived_status"], "suspicious");
    }
}
