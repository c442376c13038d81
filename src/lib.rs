//! Reply QC: drafts, judges, gates, and learns from AI replies to
//! inbound outreach messages.

pub mod config;
pub mod drafts;
pub mod error;
pub mod learning;
pub mod llm;
pub mod pipeline;
pub mod store;
