//! Per-source verification scheduling.

mod manager;
mod router;

pub use manager::{SourceContext, SourceManager, HEARTBEAT_MS};
pub use router::SourceRouter;
