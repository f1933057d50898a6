//! SQLite persistence for facts, the event timeline and annotations.

mod annotations;
mod cycle;
mod models;
mod open;
mod query;
mod schema;
pub mod transfer;

pub use models::*;
pub use open::Db;
pub use transfer::{ImportReport, LegacyEvent, LegacyExport, LegacyNote, LegacyRuntime};
