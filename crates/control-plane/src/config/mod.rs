// Server configuration loaded from environment variables
//
// Decision: Every setting has a default so the server starts with no
// environment at all; malformed values are startup errors, not silently
// replaced by defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use keel_durable::engine::{CancellationPolicy, ExecutorConfig};
use keel_durable::persistence::RetentionConfig;
use keel_durable::queue::InMemoryTaskQueueConfig;
use keel_durable::schedule::TriggerEvaluatorConfig;
use keel_durable::worker::WorkerPoolConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Complete server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub host: IpAddr,
    pub port: u16,
    /// Worker identity; generated when unset
    pub worker_id: Option<String>,
    pub max_concurrent_tasks: usize,
    pub lease_duration: Duration,
    pub scheduler_poll_interval: Duration,
    /// How long closed runs are kept
    pub retention: Duration,
    pub snapshot_interval: u64,
    /// How often failed enqueues are retried
    pub redispatch_interval: Duration,
    pub cancellation_policy: CancellationPolicy,
    pub queue_partitions: usize,
    /// Dead-letter items after this many deliveries; unlimited when unset
    pub queue_max_deliveries: Option<u32>,
    /// Prefix of every API route, e.g. "/api"
    pub api_prefix: String,
    /// Origins allowed by CORS; same-origin only when empty
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            worker_id: None,
            max_concurrent_tasks: 10,
            lease_duration: Duration::from_secs(30),
            scheduler_poll_interval: Duration::from_secs(1),
            retention: Duration::from_secs(7 * 24 * 3600),
            snapshot_interval: 50,
            redispatch_interval: Duration::from_secs(5),
            cancellation_policy: CancellationPolicy::Drain,
            queue_partitions: 8,
            queue_max_deliveries: None,
            api_prefix: String::new(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            host: parse(&var, "HOST")?.unwrap_or(defaults.host),
            port: parse(&var, "PORT")?.unwrap_or(defaults.port),
            worker_id: var("WORKER_ID"),
            max_concurrent_tasks: parse(&var, "MAX_CONCURRENT_TASKS")?
                .unwrap_or(defaults.max_concurrent_tasks),
            lease_duration: parse(&var, "LEASE_DURATION_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease_duration),
            scheduler_poll_interval: parse(&var, "SCHEDULER_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.scheduler_poll_interval),
            retention: parse(&var, "RETENTION_HOURS")?
                .map(|hours: u64| Duration::from_secs(hours * 3600))
                .unwrap_or(defaults.retention),
            snapshot_interval: parse(&var, "SNAPSHOT_INTERVAL")?
                .unwrap_or(defaults.snapshot_interval),
            redispatch_interval: parse(&var, "REDISPATCH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.redispatch_interval),
            cancellation_policy: parse(&var, "CANCELLATION_POLICY")?
                .unwrap_or(defaults.cancellation_policy),
            queue_partitions: parse(&var, "QUEUE_PARTITIONS")?
                .unwrap_or(defaults.queue_partitions),
            queue_max_deliveries: parse(&var, "QUEUE_MAX_DELIVERIES")?,
            api_prefix: var("API_PREFIX")
                .map(|p| p.trim().trim_end_matches('/').to_string())
                .unwrap_or_default(),
            cors_allowed_origins: var("CORS_ALLOWED_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_snapshot_interval(self.snapshot_interval)
            .with_cancellation_policy(self.cancellation_policy)
            .with_redispatch_interval(self.redispatch_interval)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let config = WorkerPoolConfig::new()
            .with_max_concurrency(self.max_concurrent_tasks)
            .with_lease_duration(self.lease_duration);
        match &self.worker_id {
            Some(id) => config.with_worker_id(id.clone()),
            None => config,
        }
    }

    pub fn evaluator_config(&self) -> TriggerEvaluatorConfig {
        TriggerEvaluatorConfig::default().with_poll_interval(self.scheduler_poll_interval)
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig::default().with_retention(self.retention)
    }

    pub fn queue_config(&self) -> InMemoryTaskQueueConfig {
        let config = InMemoryTaskQueueConfig::default().with_partitions(self.queue_partitions);
        match self.queue_max_deliveries {
            Some(max) => config.with_max_deliveries(max),
            None => config,
        }
    }
}

fn parse<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
