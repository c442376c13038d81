//! Background draft worker: an mpsc-fed loop that runs every trigger as an
//! independent task, bounded by a semaphore.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::processor::ReplyPipeline;
use crate::pipeline::types::InboundTrigger;

/// One unit of work. The draft id is fixed up front so a retry of the same
/// job overwrites rather than duplicates.
#[derive(Debug, Clone)]
pub struct DraftJob {
    pub draft_id: Uuid,
    pub trigger: InboundTrigger,
}

impl DraftJob {
    pub fn new(trigger: InboundTrigger) -> Self {
        Self {
            draft_id: Uuid::new_v4(),
            trigger,
        }
    }
}

pub struct DraftWorker {
    pipeline: Arc<ReplyPipeline>,
    limit: Arc<Semaphore>,
}

impl DraftWorker {
    pub fn new(pipeline: Arc<ReplyPipeline>, max_concurrent: usize) -> Self {
        Self {
            pipeline,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Start the loop. Dropping every sender stops intake; the returned
    /// handle resolves once in-flight jobs have finished.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<DraftJob>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<DraftJob>) {
        info!("Draft worker started");
        let mut tasks = JoinSet::new();

        while let Some(job) = rx.recv().await {
            let permit = match self.limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Draft worker semaphore closed");
                    break;
                }
            };

            let pipeline = self.pipeline.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let draft_id = job.draft_id;
                let conversation_id = job.trigger.conversation_id.clone();
                if let Err(e) = pipeline.process(draft_id, job.trigger).await {
                    warn!(
                        draft_id = %draft_id,
                        conversation_id = %conversation_id,
                        error = %e,
                        "Draft job failed"
                    );
                }
            });

            // Reap finished tasks so the set doesn't grow unbounded.
            while let Some(result) = tasks.try_join_next() {
                log_join(result);
            }
        }

        info!(in_flight = tasks.len(), "Draft worker draining");
        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }
        info!("Draft worker stopped");
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Draft task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::PipelineConfig;
    use crate::drafts::model::DraftStatus;
    use crate::drafts::queue::DraftQueue;
    use crate::llm::Gateway;
    use crate::llm::testing::ScriptedLlm;
    use crate::pipeline::types::LeadContext;
    use crate::store::{Database, LibSqlBackend};

    fn review_script() -> Vec<Result<String, crate::error::LlmError>> {
        vec![
            Ok(r#"{"detected_stage": "positive_reply", "reasoning": "interested"}"#.into()),
            Ok(serde_json::json!({
                "scores": {
                    "contextual_relevance": 5, "personalization": 5, "tone": 5,
                    "cta_quality": 5, "authenticity": 5
                },
                "feedback": "good"
            })
            .to_string()),
            Ok(r#"{"score": 4.6, "issues": [], "should_not_reply": false, "reasoning": "ok"}"#.into()),
        ]
    }

    fn trigger(conversation_id: &str) -> InboundTrigger {
        InboundTrigger {
            conversation_id: conversation_id.into(),
            lead_name: "Sam".into(),
            latest_message: "tell me more".into(),
            history: vec![],
            lead_context: LeadContext::default(),
        }
    }

    #[tokio::test]
    async fn processes_jobs_and_drains_on_close() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = DraftQueue::new(db.clone());
        let mut reviews = review_script();
        reviews.extend(review_script());
        let pipeline = Arc::new(ReplyPipeline::new(
            Gateway::new(Arc::new(ScriptedLlm::new(reviews))),
            Gateway::new(Arc::new(ScriptedLlm::new(vec![
                Ok("first".into()),
                Ok("second".into()),
            ]))),
            db.clone(),
            queue.clone(),
            &PipelineConfig::default(),
        ));

        // One at a time keeps the scripted replies in order.
        let (tx, handle) = DraftWorker::new(pipeline, 1).spawn(8);
        let a = DraftJob::new(trigger("conv_a"));
        let b = DraftJob::new(trigger("conv_b"));
        let (a_id, b_id) = (a.draft_id, b.draft_id);
        tx.send(a).await.unwrap();
        tx.send(b).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let pending = db.list_drafts_by_status(DraftStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(db.get_draft(a_id).await.unwrap().is_some());
        assert!(db.get_draft(b_id).await.unwrap().is_some());
        assert_eq!(queue.pending().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_job_does_not_stop_the_worker() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = DraftQueue::new(db.clone());
        let mut reviews = vec![Ok("not json".to_string())];
        reviews.extend(review_script());
        let pipeline = Arc::new(ReplyPipeline::new(
            Gateway::new(Arc::new(ScriptedLlm::new(reviews))),
            Gateway::new(Arc::new(ScriptedLlm::new(vec![Ok("reply".into())]))),
            db.clone(),
            queue,
            &PipelineConfig::default(),
        ));

        let (tx, handle) = DraftWorker::new(pipeline, 1).spawn(8);
        let bad = DraftJob::new(trigger("conv_bad"));
        let good = DraftJob::new(trigger("conv_good"));
        let (bad_id, good_id) = (bad.draft_id, good.draft_id);
        tx.send(bad).await.unwrap();
        tx.send(good).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(db.get_draft(bad_id).await.unwrap().is_none());
        assert!(db.get_draft(good_id).await.unwrap().is_some());
    }
}
