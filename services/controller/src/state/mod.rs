//! Per-job burst buffer state.
//!
//! - `record`: lifecycle states and the per-job record
//! - `store`: the mutex-guarded map that owns every record

mod record;
mod store;

pub use record::{BbState, JobRecord, RecordSummary};
pub use store::{JobStateStore, StoreGuard};
