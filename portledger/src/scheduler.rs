use crate::ledger::Ledger;
use ledger_sqlite::CycleReport;
use portledger_core::{LedgerError, PlanOptions, SingleFlight};
use socket_scan::SocketSource;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs reconciliation cycles, on a timer or on demand, never two at once.
#[derive(Clone)]
pub struct Scheduler {
    ledger: Ledger,
    source: Arc<dyn SocketSource>,
    flight: SingleFlight,
    options: PlanOptions,
}

impl Scheduler {
    pub fn new(ledger: Ledger, source: Arc<dyn SocketSource>, options: PlanOptions) -> Self {
        Scheduler { ledger, source, flight: SingleFlight::new(), options }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_busy()
    }

    /// Scan then apply, holding the single-flight guard for both steps. A scan
    /// failure leaves the store untouched. The guard travels with the blocking
    /// task, so dropping this future does not free the slot mid-cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, LedgerError> {
        let flight = self.flight.acquire().await;
        tracing::debug!(host_id = %self.ledger.host_id(), "reconciliation cycle starting");

        let source = self.source.clone();
        let ledger = self.ledger.clone();
        let options = self.options;
        let report = tokio::task::spawn_blocking(move || {
            let _flight = flight;
            let snapshot = source
                .scan(ledger.host_id())
                .map_err(|e| LedgerError::ScanUnavailable(format!("{e:#}")))?;
            ledger.apply_snapshot(&snapshot, OffsetDateTime::now_utc(), options)
        })
        .await
        .map_err(|e| LedgerError::Store(format!("cycle task failed: {e}")))??;

        tracing::info!(
            host_id = %report.host_id,
            observed = report.observed,
            appeared = report.summary.appeared,
            reappeared = report.summary.reappeared,
            process_changed = report.summary.process_changed,
            disappeared = report.summary.disappeared,
            "reconciliation cycle complete"
        );
        Ok(report)
    }

    /// First cycle runs right away, then one per `every`. Late ticks are delayed
    /// rather than bunched. Failures are logged and the loop carries on.
    pub fn spawn_periodic(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_cycle().await {
                    tracing::warn!(code = e.code(), error = %e, "reconciliation cycle skipped");
                }
            }
        })
    }
}
