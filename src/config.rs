//! Configuration types.
//!
//! Everything is read from the environment once at startup. Unset variables
//! fall back to defaults; set-but-unparseable ones are an error.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Draft pipeline and worker settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Few-shot examples per draft.
    pub example_limit: usize,
    /// Maximum triggers processed at once.
    pub max_concurrent: usize,
    /// Bounded capacity of the worker's job channel.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            example_limit: 3,
            max_concurrent: 4,
            queue_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            example_limit: env_parse("REPLY_QC_EXAMPLE_LIMIT", defaults.example_limit)?,
            max_concurrent: env_parse("REPLY_QC_MAX_CONCURRENT", defaults.max_concurrent)?,
            queue_capacity: env_parse("REPLY_QC_QUEUE_CAPACITY", defaults.queue_capacity)?,
        };
        if config.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REPLY_QC_MAX_CONCURRENT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REPLY_QC_QUEUE_CAPACITY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }
}

/// Learning loop settings.
#[derive(Debug, Clone)]
pub struct LearningConfig {
    pub enabled: bool,
    /// 6-field cron (with seconds), UTC.
    pub miner_cron: String,
    pub consolidator_cron: String,
    /// How often the scheduler checks whether a job is due.
    pub tick_interval: Duration,
    /// Miner look-back window.
    pub lookback: chrono::Duration,
    /// Consolidator learning window.
    pub window: chrono::Duration,
    /// Guidelines not reinforced within this span are deactivated.
    pub prune_after: chrono::Duration,
    /// Minimum supporting learnings (and distinct conversations) per guideline.
    pub min_support: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            miner_cron: "0 0 2 * * *".to_string(),
            consolidator_cron: "0 0 3 * * SAT".to_string(),
            tick_interval: Duration::from_secs(60),
            lookback: chrono::Duration::hours(24),
            window: chrono::Duration::days(7),
            prune_after: chrono::Duration::days(30),
            min_support: 3,
        }
    }
}

impl LearningConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let miner_cron = env_or("REPLY_QC_MINER_CRON", &defaults.miner_cron);
        let consolidator_cron = env_or("REPLY_QC_CONSOLIDATOR_CRON", &defaults.consolidator_cron);
        validate_cron("REPLY_QC_MINER_CRON", &miner_cron)?;
        validate_cron("REPLY_QC_CONSOLIDATOR_CRON", &consolidator_cron)?;

        let tick_secs: u64 = env_parse("REPLY_QC_TICK_SECS", 60)?;
        if tick_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REPLY_QC_TICK_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            enabled: env_parse("REPLY_QC_LEARNING_ENABLED", defaults.enabled)?,
            miner_cron,
            consolidator_cron,
            tick_interval: Duration::from_secs(tick_secs),
            ..defaults
        })
    }
}

/// Path of the libSQL database file.
pub fn database_path() -> PathBuf {
    PathBuf::from(env_or("REPLY_QC_DB_PATH", "./data/reply-qc.db"))
}

/// Directory for the rolling log file, if file logging is enabled.
pub fn log_dir() -> Option<PathBuf> {
    std::env::var("REPLY_QC_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_value(key, &raw),
        _ => Ok(default),
    }
}

pub(crate) fn env_secret(key: &str) -> Result<Option<SecretString>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(SecretString::from(raw.trim().to_string()))),
        Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "not valid unicode".to_string(),
        }),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

fn validate_cron(key: &str, expr: &str) -> Result<(), ConfigError> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("invalid cron expression '{expr}': {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_accepts_numbers_and_bools() {
        assert_eq!(parse_value::<usize>("K", " 8 ").unwrap(), 8);
        assert!(!parse_value::<bool>("K", "false").unwrap());
    }

    #[test]
    fn parse_value_rejects_garbage() {
        let err = parse_value::<usize>("REPLY_QC_MAX_CONCURRENT", "lots").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "REPLY_QC_MAX_CONCURRENT"));
    }

    #[test]
    fn default_crons_are_valid() {
        let config = LearningConfig::default();
        assert!(validate_cron("m", &config.miner_cron).is_ok());
        assert!(validate_cron("c", &config.consolidator_cron).is_ok());
    }

    #[test]
    fn five_field_cron_is_rejected() {
        assert!(validate_cron("m", "0 2 * * *").is_err());
    }

    #[test]
    fn defaults() {
        let p = PipelineConfig::default();
        assert_eq!((p.example_limit, p.max_concurrent, p.queue_capacity), (3, 4, 256));
        let l = LearningConfig::default();
        assert_eq!(l.min_support, 3);
        assert_eq!(l.prune_after, chrono::Duration::days(30));
    }
}
