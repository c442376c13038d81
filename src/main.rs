use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use reply_qc::config::{self, LearningConfig, PipelineConfig};
use reply_qc::drafts::DraftQueue;
use reply_qc::learning::{
    GuidelineConsolidator, LearningMiner, LearningScheduler, spawn_learning_scheduler,
};
use reply_qc::llm::{Gateway, LlmSettings, create_provider};
use reply_qc::pipeline::{DraftJob, DraftWorker, InboundTrigger, ReplyPipeline};
use reply_qc::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_tracing();

    let llm_settings = LlmSettings::from_env().context("LLM configuration")?;
    let pipeline_config = PipelineConfig::from_env().context("pipeline configuration")?;
    let learning_config = LearningConfig::from_env().context("learning configuration")?;

    eprintln!("reply-qc v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Review model: {}", llm_settings.review.model);
    eprintln!("   Draft model:  {}", llm_settings.draft.model);

    // ── LLM ──────────────────────────────────────────────────────────────
    let review = Gateway::new(create_provider(&llm_settings.review)?);
    let draft = Gateway::new(create_provider(&llm_settings.draft)?);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = config::database_path();
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .with_context(|| format!("opening database at {}", db_path.display()))?,
    );
    eprintln!("   Database: {}", db_path.display());

    // ── Review queue ─────────────────────────────────────────────────────
    let queue = DraftQueue::new(db.clone());
    let restored = queue.load_pending().await?;
    if restored > 0 {
        eprintln!("   Restored {restored} drafts awaiting review");
    }
    let events = spawn_event_printer(&queue);

    // ── Learning loop ────────────────────────────────────────────────────
    let consolidator = GuidelineConsolidator::new(
        review.clone(),
        db.clone(),
        learning_config.window,
        learning_config.prune_after,
        learning_config.min_support,
    );
    consolidator.seed_guidelines().await?;

    let scheduler = if learning_config.enabled {
        let miner = LearningMiner::new(review.clone(), db.clone(), learning_config.lookback);
        let scheduler =
            LearningScheduler::new(miner, consolidator, &learning_config, Utc::now())?;
        eprintln!(
            "   Learning: miner '{}', consolidator '{}'",
            learning_config.miner_cron, learning_config.consolidator_cron
        );
        Some(spawn_learning_scheduler(
            scheduler,
            learning_config.tick_interval,
        ))
    } else {
        eprintln!("   Learning: disabled");
        None
    };

    // ── Draft worker ─────────────────────────────────────────────────────
    let pipeline = Arc::new(ReplyPipeline::new(
        review,
        draft,
        db.clone(),
        queue.clone(),
        &pipeline_config,
    ));
    let (jobs, worker) = DraftWorker::new(pipeline, pipeline_config.max_concurrent)
        .spawn(pipeline_config.queue_capacity);

    eprintln!("   Reading inbound triggers as JSON lines on stdin.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<InboundTrigger>(&line) {
                            Ok(trigger) => {
                                let job = DraftJob::new(trigger);
                                info!(draft_id = %job.draft_id, "Trigger accepted");
                                if jobs.send(job).await.is_err() {
                                    error!("Draft worker stopped, no longer accepting triggers");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Ignoring malformed trigger line"),
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    // Let in-flight drafts finish before exiting.
    drop(jobs);
    if let Err(e) = worker.await {
        error!(error = %e, "Draft worker task failed");
    }
    if let Some((handle, stop)) = scheduler {
        // A job mid-run finishes before the ticker exits.
        let _ = stop.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "Learning scheduler task failed");
        }
    }
    events.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Stderr logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when `REPLY_QC_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match config::log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reply-qc.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}

/// Print every draft event to stdout as one JSON line for the approval surface.
fn spawn_event_printer(queue: &DraftQueue) -> tokio::task::JoinHandle<()> {
    let mut rx = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "Failed to serialize draft event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Draft event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
