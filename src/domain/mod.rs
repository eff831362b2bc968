pub mod action;
pub mod bead;
pub mod context;

pub use action::{ActionRecord, ProgressMetrics};
pub use bead::{Bead, BeadPriority, BeadStatus};
pub use context::BeadContext;
