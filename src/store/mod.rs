//! In-memory area replicas and self-originated key tracking.

mod area_store;
mod self_originated;

pub use area_store::{ApplyOutcome, AreaStore, KeyDumpFilter};
pub use self_originated::SelfOriginatedManager;
