//! Draft records and the human review queue.

pub mod model;
pub mod queue;

pub use model::{Draft, DraftEvent, DraftStatus, QaIssue, QaVerdict};
pub use queue::DraftQueue;
