//! Pure diff between the stored facts of one host and a fresh scan.
//!
//! The planner decides what happens; the store applies the plan inside one
//! transaction so that a cycle lands entirely or not at all.

use crate::model::{EventKind, FactRecord, Observation, PortKey, PortState, ScanSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Emit an `alive` event on every continuation of an already active fact.
    pub heartbeat: bool,
}

/// An event to append alongside a continuation, written before the fact row changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEvent {
    pub kind: EventKind,
    pub pid: u32,
    pub process_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// First sighting of a tuple.
    Appeared { key: PortKey, observation: Observation },
    /// Tuple seen again, whether it was active or had disappeared.
    Continued {
        fact_id: i64,
        key: PortKey,
        observation: Observation,
        events: Vec<PlannedEvent>,
        total_seen_count: u64,
        total_uptime_seconds: i64,
    },
    /// Active tuple missing from the scan. Carries the last known owner.
    Disappeared { fact_id: i64, key: PortKey, pid: u32, process_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub host_id: String,
    pub at: OffsetDateTime,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub appeared: usize,
    pub continued: usize,
    pub reappeared: usize,
    pub process_changed: usize,
    pub disappeared: usize,
}

impl CyclePlan {
    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for t in &self.transitions {
            match t {
                Transition::Appeared { .. } => s.appeared += 1,
                Transition::Continued { events, .. } => {
                    s.continued += 1;
                    for e in events {
                        match e.kind {
                            EventKind::Appeared => s.reappeared += 1,
                            EventKind::ProcessChanged => s.process_changed += 1,
                            _ => {}
                        }
                    }
                }
                Transition::Disappeared { .. } => s.disappeared += 1,
            }
        }
        s
    }
}

/// Builds the transitions for one cycle of `host_id`.
///
/// Facts and observations belonging to other hosts are ignored. Facts that are
/// already disappeared and still missing produce nothing.
pub fn plan_cycle(
    host_id: &str,
    existing: &[FactRecord],
    snapshot: &ScanSnapshot,
    now: OffsetDateTime,
    options: PlanOptions,
) -> CyclePlan {
    let known: HashMap<&PortKey, &FactRecord> = existing
        .iter()
        .filter(|f| f.key.host_id == host_id)
        .map(|f| (&f.key, f))
        .collect();

    let mut transitions = Vec::new();

    for (key, obs) in snapshot.iter().filter(|(k, _)| k.host_id == host_id) {
        let Some(fact) = known.get(key) else {
            transitions.push(Transition::Appeared { key: key.clone(), observation: obs.clone() });
            continue;
        };

        let mut events = Vec::new();
        match fact.state {
            PortState::Active => {
                if !fact.process_name.is_empty() && fact.process_name != obs.process_name {
                    events.push(PlannedEvent {
                        kind: EventKind::ProcessChanged,
                        pid: obs.pid,
                        process_name: obs.process_name.clone(),
                    });
                } else if options.heartbeat {
                    events.push(PlannedEvent {
                        kind: EventKind::Alive,
                        pid: obs.pid,
                        process_name: obs.process_name.clone(),
                    });
                }
            }
            PortState::Disappeared => events.push(PlannedEvent {
                kind: EventKind::Appeared,
                pid: obs.pid,
                process_name: obs.process_name.clone(),
            }),
        }

        transitions.push(Transition::Continued {
            fact_id: fact.id,
            key: key.clone(),
            observation: obs.clone(),
            events,
            total_seen_count: fact.total_seen_count.saturating_add(1),
            total_uptime_seconds: (now - fact.first_seen_at).whole_seconds().max(0),
        });
    }

    for fact in existing.iter().filter(|f| f.key.host_id == host_id) {
        if fact.is_active() && !snapshot.contains_key(&fact.key) {
            transitions.push(Transition::Disappeared {
                fact_id: fact.id,
                key: fact.key.clone(),
                pid: fact.pid,
                process_name: fact.process_name.clone(),
            });
        }
    }

    CyclePlan { host_id: host_id.to_string(), at: now, transitions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;
    use time::Duration;

    fn key(proto: Protocol, port: u16) -> PortKey {
        PortKey::new("local", proto, port).unwrap()
    }

    fn obs(pid: u32, name: &str) -> Observation {
        Observation { pid, process_name: name.into(), cmdline: format!("/usr/bin/{name}") }
    }

    fn fact(id: i64, k: PortKey, state: PortState, pid: u32, name: &str) -> FactRecord {
        FactRecord {
            id,
            key: k,
            first_seen_at: OffsetDateTime::UNIX_EPOCH,
            last_seen_at: OffsetDateTime::UNIX_EPOCH,
            last_disappeared_at: None,
            state,
            pid,
            process_name: name.into(),
            cmdline: String::new(),
            total_seen_count: 3,
            total_uptime_seconds: 0,
        }
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs)
    }

    #[test]
    fn unseen_key_appears() {
        let snap = ScanSnapshot::from([(key(Protocol::Tcp, 8080), obs(100, "nginx"))]);
        let plan = plan_cycle("local", &[], &snap, at(10), PlanOptions::default());
        assert_eq!(
            plan.transitions,
            vec![Transition::Appeared { key: key(Protocol::Tcp, 8080), observation: obs(100, "nginx") }]
        );
        assert_eq!(plan.summary().appeared, 1);
    }

    #[test]
    fn new_owner_on_active_fact_flags_process_change() {
        let existing = vec![fact(1, key(Protocol::Tcp, 8080), PortState::Active, 100, "nginx")];
        let snap = ScanSnapshot::from([(key(Protocol::Tcp, 8080), obs(200, "caddy"))]);
        let plan = plan_cycle("local", &existing, &snap, at(90), PlanOptions::default());
        match &plan.transitions[..] {
            [Transition::Continued { events, total_seen_count, total_uptime_seconds, observation, .. }] => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].kind, EventKind::ProcessChanged);
                assert_eq!(events[0].pid, 200);
                assert_eq!(observation.process_name, "caddy");
                assert_eq!(*total_seen_count, 4);
                assert_eq!(*total_uptime_seconds, 90);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn empty_stored_name_never_flags_process_change() {
        let existing = vec![fact(1, key(Protocol::Tcp, 22), PortState::Active, 7, "")];
        let snap = ScanSnapshot::from([(key(Protocol::Tcp, 22), obs(7, "sshd"))]);
        let plan = plan_cycle("local", &existing, &snap, at(5), PlanOptions::default());
        assert!(matches!(&plan.transitions[..], [Transition::Continued { events, .. }] if events.is_empty()));
    }

    #[test]
    fn missing_active_fact_disappears_once() {
        let existing = vec![
            fact(1, key(Protocol::Udp, 53), PortState::Active, 9, "dnsmasq"),
            fact(2, key(Protocol::Udp, 5353), PortState::Disappeared, 10, "avahi"),
        ];
        let plan = plan_cycle("local", &existing, &ScanSnapshot::new(), at(5), PlanOptions::default());
        assert_eq!(
            plan.transitions,
            vec![Transition::Disappeared {
                fact_id: 1,
                key: key(Protocol::Udp, 53),
                pid: 9,
                process_name: "dnsmasq".into()
            }]
        );
    }

    #[test]
    fn reappearance_emits_appeared_on_existing_fact() {
        let existing = vec![fact(4, key(Protocol::Tcp, 3000), PortState::Disappeared, 1, "node")];
        let snap = ScanSnapshot::from([(key(Protocol::Tcp, 3000), obs(2, "node"))]);
        let plan = plan_cycle("local", &existing, &snap, at(5), PlanOptions::default());
        match &plan.transitions[..] {
            [Transition::Continued { fact_id, events, .. }] => {
                assert_eq!(*fact_id, 4);
                assert_eq!(events.iter().map(|e| e.kind).collect::<Vec<_>>(), vec![EventKind::Appeared]);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
        assert_eq!(plan.summary().reappeared, 1);
    }

    #[test]
    fn heartbeat_is_opt_in() {
        let existing = vec![fact(1, key(Protocol::Tcp, 443), PortState::Active, 5, "caddy")];
        let snap = ScanSnapshot::from([(key(Protocol::Tcp, 443), obs(5, "caddy"))]);

        let quiet = plan_cycle("local", &existing, &snap, at(5), PlanOptions::default());
        assert!(matches!(&quiet.transitions[..], [Transition::Continued { events, .. }] if events.is_empty()));

        let loud = plan_cycle("local", &existing, &snap, at(5), PlanOptions { heartbeat: true });
        assert!(matches!(
            &loud.transitions[..],
            [Transition::Continued { events, .. }] if events.len() == 1 && events[0].kind == EventKind::Alive
        ));
    }

    #[test]
    fn same_port_different_protocol_are_separate() {
        let snap = ScanSnapshot::from([
            (key(Protocol::Tcp, 53), obs(9, "dnsmasq")),
            (key(Protocol::Udp, 53), obs(9, "dnsmasq")),
        ]);
        let plan = plan_cycle("local", &[], &snap, at(0), PlanOptions::default());
        assert_eq!(plan.summary().appeared, 2);
    }

    #[test]
    fn other_hosts_are_ignored() {
        let foreign = PortKey::new("elsewhere", Protocol::Tcp, 22).unwrap();
        let existing = vec![fact(1, foreign.clone(), PortState::Active, 1, "sshd")];
        let snap = ScanSnapshot::from([(foreign, obs(1, "sshd"))]);
        let plan = plan_cycle("local", &existing, &snap, at(0), PlanOptions::default());
        assert!(plan.transitions.is_empty());
    }

    #[test]
    fn uptime_never_negative_when_clock_steps_back() {
        let mut f = fact(1, key(Protocol::Tcp, 80), PortState::Active, 1, "httpd");
        f.first_seen_at = at(100);
        let snap = ScanSnapshot::from([(key(Protocol::Tcp, 80), obs(1, "httpd"))]);
        let plan = plan_cycle("local", &[f], &snap, at(50), PlanOptions::default());
        assert!(matches!(
            &plan.transitions[..],
            [Transition::Continued { total_uptime_seconds: 0, .. }]
        ));
    }
}
