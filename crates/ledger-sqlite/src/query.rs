use crate::cycle::{insert_event, load_facts};
use crate::models::{
    event_from_row, fact_from_row, latest_from_row, to_ms, EventId, FactId, EVENT_COLUMNS, FACT_COLUMNS,
};
use crate::Db;
use anyhow::Result;
use portledger_core::{merge_view, EventKind, FactRecord, LatestEvent, MergedPortItem, PortKey, TimelineEvent};
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;

impl Db {
    /// All facts, or those of one host, ordered by tuple.
    pub fn facts(&self, host_id: Option<&str>) -> Result<Vec<FactRecord>> {
        match host_id {
            Some(h) => {
                let mut facts = load_facts(&self.conn, h)?;
                facts.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(facts)
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("SELECT {FACT_COLUMNS} FROM port_fact"))?;
                let mut facts = stmt.query_map([], fact_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
                facts.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(facts)
            }
        }
    }

    pub fn fact_by_key(&self, key: &PortKey) -> Result<Option<FactRecord>> {
        let fact = self
            .conn
            .query_row(
                &format!("SELECT {FACT_COLUMNS} FROM port_fact WHERE host_id=? AND protocol=? AND port=?"),
                params![key.host_id, key.protocol.as_str(), key.port],
                fact_from_row,
            )
            .optional()?;
        Ok(fact)
    }

    /// Events of one fact, newest first.
    pub fn timeline(&self, fact_id: FactId, limit: Option<usize>) -> Result<Vec<TimelineEvent>> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM port_event WHERE fact_id=? ORDER BY at_ms DESC, event_id DESC LIMIT ?"
        ))?;
        let rows = stmt.query_map(params![fact_id, limit], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every event in insertion order. Used by exports.
    pub fn all_events(&self) -> Result<Vec<TimelineEvent>> {
        let mut stmt = self.conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM port_event ORDER BY event_id"))?;
        let rows = stmt.query_map([], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent event (highest id) of every fact of `host_id`.
    pub fn latest_events(&self, host_id: &str) -> Result<Vec<LatestEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.fact_id, e.kind, e.at_ms
             FROM port_event e
             JOIN (SELECT fact_id, MAX(event_id) AS max_id FROM port_event GROUP BY fact_id) m
               ON e.event_id = m.max_id
             JOIN port_fact f ON f.fact_id = e.fact_id
             WHERE f.host_id = ?",
        )?;
        let rows = stmt.query_map([host_id], latest_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Facts and annotations of `host_id` joined by tuple, with derived status.
    pub fn list_merged(&self, host_id: &str, now: OffsetDateTime) -> Result<Vec<MergedPortItem>> {
        let facts = self.facts(Some(host_id))?;
        let notes = self.annotations(Some(host_id))?;
        let latest = self.latest_events(host_id)?;
        Ok(merge_view(&facts, &notes, &latest, now))
    }

    /// Appends an operator event (`acknowledged`, `diagnosed`) outside a cycle.
    pub fn append_event(
        &self,
        fact_id: FactId,
        kind: EventKind,
        at: OffsetDateTime,
        pid: u32,
        process_name: &str,
        detail: Option<&str>,
    ) -> Result<EventId> {
        insert_event(&self.conn, fact_id, kind, to_ms(at), pid, process_name, detail)
    }

    /// Removes the fact and, through the cascade, its timeline. Annotations stay.
    pub fn delete_fact(&self, key: &PortKey) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM port_fact WHERE host_id=? AND protocol=? AND port=?",
            params![key.host_id, key.protocol.as_str(), key.port],
        )?;
        Ok(n > 0)
    }
}
