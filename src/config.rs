//! Node configuration.

use std::time::Duration;

use crate::actor::GraphActorConfig;
use crate::executor::ExecutorConfig;

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base address of the FaaS backend
    pub faas_addr: String,

    /// PostgreSQL connection URL; in-memory persistence when unset
    pub database_url: Option<String>,

    /// Hard timeout for outbound FaaS HTTP calls
    pub http_timeout: Duration,

    /// Idle time before a live flow passivates
    pub inactivity_timeout: Duration,

    /// Idle time before a completed flow passivates, and the wait budget for
    /// stage result reads
    pub read_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let faas_addr = std::env::var("MILLRACE_FAAS_ADDR")
            .unwrap_or_else(|_| "http://localhost:8080/r".to_string());

        let database_url = std::env::var("MILLRACE_DATABASE_URL").ok();

        let http_timeout = duration_var("MILLRACE_HTTP_TIMEOUT_SECONDS", 300)?;
        let inactivity_timeout = duration_var("MILLRACE_INACTIVITY_TIMEOUT_SECONDS", 24 * 60 * 60)?;
        let read_timeout = duration_var("MILLRACE_READ_TIMEOUT_SECONDS", 5 * 60)?;

        Ok(Config {
            faas_addr,
            database_url,
            http_timeout,
            inactivity_timeout,
            read_timeout,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            faas_addr: self.faas_addr.clone(),
            request_timeout: self.http_timeout,
        }
    }

    pub fn actor_config(&self) -> GraphActorConfig {
        GraphActorConfig {
            inactivity_timeout: self.inactivity_timeout,
            read_timeout: self.read_timeout,
        }
    }
}

fn duration_var(name: &str, default_seconds: u64) -> anyhow::Result<Duration> {
    let seconds = match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("{name} must be an integer number of seconds"))?,
        Err(_) => default_seconds,
    };
    Ok(Duration::from_secs(seconds))
}
