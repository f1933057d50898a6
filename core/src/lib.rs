//! Core types and pure derivations for the port ledger.
//!
//! Facts are what the machine observed, annotations are what a human wrote down.
//! Everything in this crate is free of I/O: the reconciliation planner, the status
//! deriver and the merged view all work on plain values handed in by the caller.

pub mod error;
pub mod model;
pub mod reconcile;
pub mod single_flight;
pub mod status;
pub mod view;

pub use error::LedgerError;
pub use model::*;
pub use reconcile::{plan_cycle, CyclePlan, PlanOptions, PlanSummary, PlannedEvent, Transition};
pub use single_flight::{FlightGuard, SingleFlight};
pub use status::derive_status;
pub use view::{format_uptime, merge_view, LatestEvent, MergedPortItem};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
