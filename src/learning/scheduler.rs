//! Cron ticker for the learning jobs.
//!
//! A single task owns both jobs and runs them one after the other, so a
//! job never overlaps itself or the other. Fires missed while a job ran
//! (or while the process slept) collapse into one run.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::LearningConfig;
use crate::error::ConfigError;
use crate::learning::consolidator::{ConsolidationReport, GuidelineConsolidator};
use crate::learning::miner::{LearningMiner, MiningReport};

/// One cron-scheduled job's timing state.
struct CronJob {
    name: &'static str,
    schedule: cron::Schedule,
    next_fire: Option<DateTime<Utc>>,
}

impl CronJob {
    fn new(name: &'static str, expr: &str, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        let schedule = cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
            key: name.to_string(),
            message: format!("invalid cron expression '{expr}': {e}"),
        })?;
        let next_fire = schedule.after(&now).next();
        info!(job = name, next_fire = ?next_fire, "Learning job scheduled");
        Ok(Self {
            name,
            schedule,
            next_fire,
        })
    }

    /// True when the job is due; advances the next fire past `now`.
    fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.next_fire {
            Some(at) if at <= now => {
                self.next_fire = self.schedule.after(&now).next();
                true
            }
            _ => false,
        }
    }
}

/// What a tick ran.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub mined: Option<MiningReport>,
    pub consolidated: Option<ConsolidationReport>,
}

pub struct LearningScheduler {
    miner: LearningMiner,
    consolidator: GuidelineConsolidator,
    miner_job: CronJob,
    consolidator_job: CronJob,
}

impl LearningScheduler {
    pub fn new(
        miner: LearningMiner,
        consolidator: GuidelineConsolidator,
        config: &LearningConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            miner,
            consolidator,
            miner_job: CronJob::new("learning_miner", &config.miner_cron, now)?,
            consolidator_job: CronJob::new(
                "guideline_consolidator",
                &config.consolidator_cron,
                now,
            )?,
        })
    }

    /// Run whichever jobs are due at `now`. Failures are logged, never raised.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if self.miner_job.take_due(now) {
            info!(job = self.miner_job.name, "Running learning job");
            match self.miner.run(now).await {
                Ok(report) => outcome.mined = Some(report),
                Err(e) => error!(job = self.miner_job.name, error = %e, "Learning job failed"),
            }
        }

        if self.consolidator_job.take_due(now) {
            info!(job = self.consolidator_job.name, "Running learning job");
            match self.consolidator.run(now).await {
                Ok(report) => outcome.consolidated = Some(report),
                Err(e) => {
                    error!(job = self.consolidator_job.name, error = %e, "Learning job failed")
                }
            }
        }

        outcome
    }
}

/// Spawn the ticker. Checks for due jobs every `interval`.
///
/// Returns a `JoinHandle` and a stop sender. Send `true` to stop; a job
/// already running finishes before the task exits.
pub fn spawn_learning_scheduler(
    mut scheduler: LearningScheduler,
    interval: Duration,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scheduler.tick(Utc::now()).await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        info!("Learning scheduler stopped");
                        return;
                    }
                }
            }
        }
    });

    (handle, stop_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;

    use crate::llm::Gateway;
    use crate::llm::testing::ScriptedLlm;
    use crate::store::{Database, LibSqlBackend};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    async fn scheduler(now: DateTime<Utc>) -> LearningScheduler {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let gateway = Gateway::new(Arc::new(ScriptedLlm::new(vec![])));
        let config = LearningConfig::default();
        LearningScheduler::new(
            LearningMiner::new(gateway.clone(), db.clone(), config.lookback),
            GuidelineConsolidator::new(
                gateway,
                db,
                config.window,
                config.prune_after,
                config.min_support,
            ),
            &config,
            now,
        )
        .unwrap()
    }

    #[test]
    fn take_due_advances_past_now() {
        let start = at(2026, 1, 1, 1, 0, 0);
        let mut job = CronJob::new("miner", "0 0 2 * * *", start).unwrap();
        assert_eq!(job.next_fire, Some(at(2026, 1, 1, 2, 0, 0)));
        assert!(!job.take_due(at(2026, 1, 1, 1, 59, 59)));
        // Two missed days collapse into one run.
        assert!(job.take_due(at(2026, 1, 3, 9, 0, 0)));
        assert_eq!(job.next_fire, Some(at(2026, 1, 4, 2, 0, 0)));
        assert!(!job.take_due(at(2026, 1, 3, 9, 1, 0)));
    }

    #[tokio::test]
    async fn stop_signal_ends_the_ticker() {
        let scheduler = scheduler(Utc::now()).await;
        let (handle, stop) = spawn_learning_scheduler(scheduler, Duration::from_secs(3600));
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[test]
    fn invalid_expression_is_config_error() {
        assert!(matches!(
            CronJob::new("miner", "every day", Utc::now()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn runs_jobs_on_their_schedules() {
        // 2026-01-02 is a Friday; the consolidator fires Saturday 03:00.
        let mut scheduler = scheduler(at(2026, 1, 2, 0, 0, 0)).await;

        let outcome = scheduler.tick(at(2026, 1, 2, 1, 0, 0)).await;
        assert!(outcome.mined.is_none());
        assert!(outcome.consolidated.is_none());

        let outcome = scheduler.tick(at(2026, 1, 2, 2, 0, 30)).await;
        assert_eq!(outcome.mined, Some(MiningReport::default()));
        assert!(outcome.consolidated.is_none());

        let outcome = scheduler.tick(at(2026, 1, 3, 3, 0, 30)).await;
        assert!(outcome.mined.is_some());
        let consolidated = outcome.consolidated.unwrap();
        assert_eq!(consolidated.learnings_considered, 0);
        assert!(consolidated.error.is_none());
    }
}
