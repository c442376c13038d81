//! Reply pipeline.
//!
//! Each inbound trigger flows through:
//! 1. `StageClassifier` picks the funnel stage
//! 2. `ExampleRetriever` pulls past approved replies at that stage
//! 3. `RevisionController` drafts, judges, and revises at most once
//! 4. `QaGate` checks the result and may regenerate once more
//! 5. `ReplyPipeline` persists the draft and queues it for review
//!
//! Blocked drafts are stored as rejected and never reach the queue.

pub mod generator;
pub mod judge;
pub mod processor;
pub mod prompts;
pub mod qa;
pub mod retriever;
pub mod revision;
pub mod stage;
pub mod types;
pub mod worker;

pub use processor::{DraftOutcome, ReplyPipeline};
pub use types::{Conversation, FunnelStage, HistoryMessage, InboundTrigger, LeadContext};
pub use worker::{DraftJob, DraftWorker};
