use crate::models::{count_to_sql, fact_from_row, to_ms, CycleReport, EventId, FactId, FACT_COLUMNS};
use crate::Db;
use anyhow::{Context, Result};
use portledger_core::{
    plan_cycle, CyclePlan, EventKind, FactRecord, PlanOptions, PortKey, ScanSnapshot, Transition,
};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

impl Db {
    /// One reconciliation cycle for `host_id`: load, plan, apply, all in one transaction.
    /// Any failure rolls the whole cycle back.
    pub fn run_cycle(
        &mut self,
        host_id: &str,
        snapshot: &ScanSnapshot,
        now: OffsetDateTime,
        options: PlanOptions,
    ) -> Result<CycleReport> {
        let tx = self.conn.transaction()?;
        let existing = load_facts(&tx, host_id)?;
        let plan = plan_cycle(host_id, &existing, snapshot, now, options);
        let events_written = apply_plan(&tx, &plan).context("failed to apply cycle")?;
        tx.commit()?;

        let report = CycleReport {
            host_id: host_id.to_string(),
            at: now,
            observed: snapshot.keys().filter(|k| k.host_id == host_id).count(),
            summary: plan.summary(),
            events_written,
        };
        tracing::debug!(
            host_id,
            observed = report.observed,
            appeared = report.summary.appeared,
            disappeared = report.summary.disappeared,
            process_changed = report.summary.process_changed,
            "cycle applied"
        );
        Ok(report)
    }
}

pub(crate) fn load_facts(conn: &Connection, host_id: &str) -> Result<Vec<FactRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FACT_COLUMNS} FROM port_fact WHERE host_id=? ORDER BY fact_id"
    ))?;
    let rows = stmt.query_map([host_id], fact_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Writes every transition of the plan and returns the number of events appended.
fn apply_plan(conn: &Connection, plan: &CyclePlan) -> Result<usize> {
    let now_ms = to_ms(plan.at);
    let mut events = 0usize;
    for t in &plan.transitions {
        match t {
            Transition::Appeared { key, observation } => {
                let fact_id = insert_fact(conn, key, now_ms, observation.pid, &observation.process_name, &observation.cmdline)?;
                insert_event(conn, fact_id, EventKind::Appeared, now_ms, observation.pid, &observation.process_name, None)?;
                events += 1;
            }
            Transition::Continued { fact_id, key, observation, events: planned, total_seen_count, total_uptime_seconds } => {
                for e in planned {
                    if e.kind == EventKind::ProcessChanged {
                        tracing::warn!(%key, pid = e.pid, process = %e.process_name, "owning process changed");
                    }
                    insert_event(conn, *fact_id, e.kind, now_ms, e.pid, &e.process_name, None)?;
                    events += 1;
                }
                conn.execute(
                    "UPDATE port_fact SET last_seen_ms=?, state='active', pid=?, process_name=?, cmdline=?,
                     total_seen_count=?, total_uptime_seconds=? WHERE fact_id=?",
                    params![
                        now_ms,
                        observation.pid,
                        observation.process_name,
                        observation.cmdline,
                        count_to_sql(*total_seen_count),
                        total_uptime_seconds,
                        fact_id
                    ],
                )?;
            }
            Transition::Disappeared { fact_id, pid, process_name, .. } => {
                conn.execute(
                    "UPDATE port_fact SET state='disappeared', last_disappeared_ms=? WHERE fact_id=?",
                    params![now_ms, fact_id],
                )?;
                insert_event(conn, *fact_id, EventKind::Disappeared, now_ms, *pid, process_name, None)?;
                events += 1;
            }
        }
    }
    Ok(events)
}

fn insert_fact(conn: &Connection, key: &PortKey, now_ms: i64, pid: u32, process_name: &str, cmdline: &str) -> Result<FactId> {
    conn.execute(
        "INSERT INTO port_fact(host_id,protocol,port,first_seen_ms,last_seen_ms,state,pid,process_name,cmdline,total_seen_count,total_uptime_seconds)
         VALUES (?,?,?,?,?,'active',?,?,?,1,0)",
        params![key.host_id, key.protocol.as_str(), key.port, now_ms, now_ms, pid, process_name, cmdline],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn insert_event(
    conn: &Connection,
    fact_id: FactId,
    kind: EventKind,
    at_ms: i64,
    pid: u32,
    process_name: &str,
    detail: Option<&str>,
) -> Result<EventId> {
    conn.execute(
        "INSERT INTO port_event(fact_id,kind,at_ms,pid,process_name,detail) VALUES (?,?,?,?,?,?)",
        params![fact_id, kind.as_str(), at_ms, pid, process_name, detail],
    )?;
    Ok(conn.last_insert_rowid())
}
