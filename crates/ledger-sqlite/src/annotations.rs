use crate::models::{note_from_row, NOTE_COLUMNS};
use crate::Db;
use anyhow::Result;
use portledger_core::{AnnotationPatch, AnnotationRecord, PortKey};
use rusqlite::{params, Connection, OptionalExtension};

impl Db {
    pub fn annotation(&self, key: &PortKey) -> Result<Option<AnnotationRecord>> {
        note_by_key(&self.conn, key)
    }

    pub fn annotations(&self, host_id: Option<&str>) -> Result<Vec<AnnotationRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NOTE_COLUMNS} FROM port_note WHERE (?1 IS NULL OR host_id=?1) ORDER BY host_id, protocol, port"
        ))?;
        let rows = stmt.query_map([host_id], note_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Update-or-create by tuple. Fields missing from `patch` keep their value,
    /// or take the defaults on create.
    pub fn upsert_annotation(&mut self, key: &PortKey, patch: &AnnotationPatch) -> Result<AnnotationRecord> {
        let tx = self.conn.transaction()?;
        let mut note = note_by_key(&tx, key)?.unwrap_or_else(|| AnnotationRecord::new_default(key.clone()));
        patch.apply(&mut note);
        tx.execute(
            "INSERT INTO port_note(host_id,protocol,port,title,description,owner,risk_level,is_pinned) VALUES (?,?,?,?,?,?,?,?)
             ON CONFLICT(host_id,protocol,port) DO UPDATE SET title=excluded.title, description=excluded.description,
               owner=excluded.owner, risk_level=excluded.risk_level, is_pinned=excluded.is_pinned",
            params![
                key.host_id,
                key.protocol.as_str(),
                key.port,
                note.title,
                note.description,
                note.owner,
                note.risk_level.as_str(),
                note.is_pinned as i64
            ],
        )?;
        let stored = note_by_key(&tx, key)?
            .ok_or_else(|| anyhow::anyhow!("annotation for {key} vanished inside its own transaction"))?;
        tx.commit()?;
        Ok(stored)
    }

    pub fn delete_annotation(&self, key: &PortKey) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM port_note WHERE host_id=? AND protocol=? AND port=?",
            params![key.host_id, key.protocol.as_str(), key.port],
        )?;
        Ok(n > 0)
    }
}

fn note_by_key(conn: &Connection, key: &PortKey) -> Result<Option<AnnotationRecord>> {
    let note = conn
        .query_row(
            &format!("SELECT {NOTE_COLUMNS} FROM port_note WHERE host_id=? AND protocol=? AND port=?"),
            params![key.host_id, key.protocol.as_str(), key.port],
            note_from_row,
        )
        .optional()?;
    Ok(note)
}
