//! Learning loop: mine human edits into learnings, consolidate them into
//! QA guidelines, and run both on a schedule.

pub mod consolidator;
pub mod miner;
pub mod model;
pub mod scheduler;

pub use consolidator::{ConsolidationReport, GuidelineConsolidator};
pub use miner::{LearningMiner, MiningReport};
pub use model::{Guideline, GuidelineKind, GuidelineScope, Learning, LearningType};
pub use scheduler::{LearningScheduler, spawn_learning_scheduler};
