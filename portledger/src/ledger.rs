use ledger_sqlite::{CycleReport, Db, ImportReport, LegacyExport};
use portledger_core::{
    AnnotationPatch, AnnotationRecord, EventKind, LedgerError, MergedPortItem, PlanOptions, PortKey, ScanSnapshot,
    TimelineEvent,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

/// Shared handle over the store. Every operation maps storage failures into
/// `LedgerError` so callers see one error taxonomy.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Mutex<Db>>,
    host_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub fact_deleted: bool,
    pub note_deleted: bool,
}

fn into_ledger_error(err: anyhow::Error) -> LedgerError {
    match err.downcast::<LedgerError>() {
        Ok(e) => e,
        Err(other) => LedgerError::store(other),
    }
}

impl Ledger {
    pub fn new(db: Db, host_id: impl Into<String>) -> Self {
        Ledger { db: Arc::new(Mutex::new(db)), host_id: host_id.into() }
    }

    /// The host this process scans. Reads may still ask about other hosts.
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Db) -> anyhow::Result<T>) -> Result<T, LedgerError> {
        let mut db = self.db.lock().map_err(|_| LedgerError::Store("ledger lock poisoned".to_string()))?;
        f(&mut *db).map_err(into_ledger_error)
    }

    pub fn ping(&self) -> Result<(), LedgerError> {
        self.with_db(|db| db.ping())
    }

    /// Apply half of a reconciliation cycle for the local host.
    pub fn apply_snapshot(
        &self,
        snapshot: &ScanSnapshot,
        now: OffsetDateTime,
        options: PlanOptions,
    ) -> Result<CycleReport, LedgerError> {
        self.with_db(|db| db.run_cycle(&self.host_id, snapshot, now, options))
    }

    pub fn list_merged(&self, host_id: &str) -> Result<Vec<MergedPortItem>, LedgerError> {
        self.with_db(|db| db.list_merged(host_id, OffsetDateTime::now_utc()))
    }

    /// Newest first. `NotFound` when the tuple has never been observed.
    pub fn timeline(&self, key: &PortKey, limit: Option<usize>) -> Result<Vec<TimelineEvent>, LedgerError> {
        self.with_db(|db| {
            let fact = db
                .fact_by_key(key)?
                .ok_or_else(|| LedgerError::NotFound(format!("no port record for {key}")))?;
            db.timeline(fact.id, limit)
        })
    }

    pub fn annotation(&self, key: &PortKey) -> Result<AnnotationRecord, LedgerError> {
        self.with_db(|db| db.annotation(key))?
            .ok_or_else(|| LedgerError::NotFound(format!("no note for {key}")))
    }

    /// A patch that sets nothing is rejected rather than creating a blank note.
    pub fn upsert_annotation(&self, key: &PortKey, patch: &AnnotationPatch) -> Result<AnnotationRecord, LedgerError> {
        if patch.is_empty() {
            return Err(LedgerError::validation("note update sets no fields"));
        }
        let note = self.with_db(|db| db.upsert_annotation(key, patch))?;
        tracing::info!(%key, risk = %note.risk_level, "note saved");
        Ok(note)
    }

    pub fn delete_annotation(&self, key: &PortKey) -> Result<bool, LedgerError> {
        self.with_db(|db| db.delete_annotation(key))
    }

    /// Removes both the fact and the note for a tuple. The two deletes are
    /// independent: one failing does not stop the other.
    pub fn delete_tuple(&self, key: &PortKey) -> Result<DeleteOutcome, LedgerError> {
        let fact = self.with_db(|db| db.delete_fact(key));
        let note = self.with_db(|db| db.delete_annotation(key));
        match (fact, note) {
            (Err(e), Err(_)) => Err(e),
            (fact, note) => {
                if let Err(e) = &fact {
                    tracing::warn!(%key, error = %e, "fact delete failed");
                }
                if let Err(e) = &note {
                    tracing::warn!(%key, error = %e, "note delete failed");
                }
                let outcome = DeleteOutcome {
                    fact_deleted: fact.unwrap_or(false),
                    note_deleted: note.unwrap_or(false),
                };
                tracing::info!(%key, fact = outcome.fact_deleted, note = outcome.note_deleted, "tuple forgotten");
                Ok(outcome)
            }
        }
    }

    /// Appends an operator event to the fact's timeline, tagged with the last known owner.
    fn append_operator_event(
        &self,
        key: &PortKey,
        kind: EventKind,
        output: Option<&str>,
    ) -> Result<TimelineEvent, LedgerError> {
        let now = OffsetDateTime::now_utc();
        self.with_db(|db| {
            let fact = db
                .fact_by_key(key)?
                .ok_or_else(|| LedgerError::NotFound(format!("no port record for {key}")))?;
            let id = db.append_event(fact.id, kind, now, fact.pid, &fact.process_name, output)?;
            Ok(TimelineEvent {
                id,
                fact_id: fact.id,
                kind,
                timestamp: now,
                pid: fact.pid,
                process_name: fact.process_name,
                output: output.map(str::to_string),
            })
        })
    }

    pub fn acknowledge(&self, key: &PortKey) -> Result<TimelineEvent, LedgerError> {
        self.append_operator_event(key, EventKind::Acknowledged, None)
    }

    /// The key carries the protocol, so tcp and udp on one port never get mixed up.
    pub fn record_diagnosis(&self, key: &PortKey, output: &str) -> Result<TimelineEvent, LedgerError> {
        self.append_operator_event(key, EventKind::Diagnosed, Some(output))
    }

    pub fn export_legacy(&self) -> Result<LegacyExport, LedgerError> {
        self.with_db(|db| db.export_legacy())
    }

    pub fn import_legacy(&self, data: &LegacyExport) -> Result<ImportReport, LedgerError> {
        self.with_db(|db| db.import_legacy(data))
    }
}
