//! Record log implementation.
//!
//! Records are stored in an append-only log; the index maps record ids to
//! log offsets and value digests to record ids.

mod index;
mod log;

pub use index::RecordIndex;
pub use log::RecordLog;
