//! Process configuration from the environment.

use std::time::Duration;

use anyhow::Result;

const REDIS_DEFAULT: &str = "localhost:6379";
const SCHEDULER_SLEEP_DEFAULT: Duration = Duration::from_secs(60);

/// Environment settings shared by the scheduler and worker modes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URI; required for every mode except `--noDb`.
    pub database_url: Option<String>,

    /// Redis `host:port`.
    pub redis_addr: String,

    /// Slack-style webhook receiving alert notifications, optional.
    pub slack_webhook: Option<String>,

    /// Pause between two scheduler iterations of one pipe.
    pub scheduler_sleep: Duration,
}

impl Config {
    /// Reads configuration from the environment:
    /// - DATABASE_URL (optional here, checked by the modes that need it)
    /// - REDIS (optional, default: localhost:6379)
    /// - SLACK_WEBHOOK (optional)
    /// - SCHEDULER_SLEEP (optional, seconds, default: 60)
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            redis_addr: std::env::var("REDIS")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| REDIS_DEFAULT.to_string()),
            slack_webhook: std::env::var("SLACK_WEBHOOK").ok().filter(|s| !s.is_empty()),
            scheduler_sleep: std::env::var("SCHEDULER_SLEEP")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(SCHEDULER_SLEEP_DEFAULT),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis_addr.is_empty() {
            anyhow::bail!("REDIS address cannot be empty");
        }
        if self.scheduler_sleep.is_zero() {
            anyhow::bail!("SCHEDULER_SLEEP must be greater than 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_addr: REDIS_DEFAULT.to_string(),
            slack_webhook: None,
            scheduler_sleep: SCHEDULER_SLEEP_DEFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.redis_addr, "localhost:6379");
        assert_eq!(config.scheduler_sleep, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_redis_and_zero_sleep() {
        let mut config = Config::default();

        config.redis_addr = String::new();
        assert!(config.validate().is_err());

        config.redis_addr = "localhost:6379".to_string();
        config.scheduler_sleep = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
