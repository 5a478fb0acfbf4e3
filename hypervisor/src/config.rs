use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the hypervisor listens on
    pub port: u16,
    /// Path to the hypervisor SQLite database
    pub database_url: String,
    /// Base URL of the sandbox gateway API
    pub gateway_base_url: String,
    /// Bearer token presented to the sandbox gateway
    pub gateway_token: Option<String>,
    /// Per-request timeout for gateway HTTP calls
    pub gateway_request_timeout: Duration,
    pub readiness: ReadinessPolicy,
    /// How long to wait for the interrupt WebSocket to connect
    pub interrupt_connect_timeout: Duration,
    /// How long to wait for the agent to acknowledge an interrupt
    pub interrupt_ack_timeout: Duration,
    /// A RUNNING task untouched for longer than this is swept to ERROR
    pub stale_task_max_age: Duration,
    pub stale_task_sweep_interval: Duration,
    /// Upper bound on stale tasks logged per sweep
    pub stale_task_sweep_limit: i64,
    pub reconcile_interval: Duration,
    /// Refuse new work once a user has this many genuinely running topics
    pub max_running_topics_per_user: Option<usize>,
}

/// Polling parameters for `wait_for_workspace_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            interval: Duration::from_secs(2),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9090,
            database_url: "sqlite:./data/hypervisor.db".to_string(),
            gateway_base_url: "http://127.0.0.1:8800".to_string(),
            gateway_token: None,
            gateway_request_timeout: Duration::from_secs(30),
            readiness: ReadinessPolicy::default(),
            interrupt_connect_timeout: Duration::from_secs(10),
            interrupt_ack_timeout: Duration::from_secs(60),
            stale_task_max_age: Duration::from_secs(3 * 60 * 60),
            stale_task_sweep_interval: Duration::from_secs(600),
            stale_task_sweep_limit: 100,
            reconcile_interval: Duration::from_secs(300),
            max_running_topics_per_user: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let readiness = ReadinessPolicy {
            timeout: env_secs("WORKSPACE_READY_TIMEOUT_SECS", d.readiness.timeout)?,
            interval: env_secs("WORKSPACE_READY_INTERVAL_SECS", d.readiness.interval)?,
        };
        if readiness.interval.is_zero() {
            return Err(anyhow::anyhow!(
                "WORKSPACE_READY_INTERVAL_SECS must be greater than zero"
            ));
        }

        Ok(Self {
            port: env_parse("HYPERVISOR_PORT", d.port)?,
            database_url: env_str("HYPERVISOR_DATABASE_URL", &d.database_url),
            gateway_base_url: env_str("SANDBOX_GATEWAY_BASE_URL", &d.gateway_base_url),
            gateway_token: std::env::var("SANDBOX_GATEWAY_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            gateway_request_timeout: env_secs(
                "SANDBOX_GATEWAY_TIMEOUT_SECS",
                d.gateway_request_timeout,
            )?,
            readiness,
            interrupt_connect_timeout: env_secs(
                "INTERRUPT_CONNECT_TIMEOUT_SECS",
                d.interrupt_connect_timeout,
            )?,
            interrupt_ack_timeout: env_secs("INTERRUPT_ACK_TIMEOUT_SECS", d.interrupt_ack_timeout)?,
            stale_task_max_age: env_secs("STALE_TASK_MAX_AGE_SECS", d.stale_task_max_age)?,
            stale_task_sweep_interval: env_secs(
                "STALE_TASK_SWEEP_INTERVAL_SECS",
                d.stale_task_sweep_interval,
            )?,
            stale_task_sweep_limit: env_parse("STALE_TASK_SWEEP_LIMIT", d.stale_task_sweep_limit)?,
            reconcile_interval: env_secs("RECONCILE_INTERVAL_SECS", d.reconcile_interval)?,
            max_running_topics_per_user: env_opt("MAX_RUNNING_TOPICS_PER_USER")?,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

fn env_opt<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_reports_bad_values() {
        std::env::set_var("HYPERVISOR_TEST_BAD_PORT", "ninety");
        let err = env_parse::<u16>("HYPERVISOR_TEST_BAD_PORT", 9090).unwrap_err();
        assert!(err.to_string().contains("HYPERVISOR_TEST_BAD_PORT=ninety"));
        std::env::remove_var("HYPERVISOR_TEST_BAD_PORT");
    }

    #[test]
    fn test_env_opt_unset_is_none() {
        let v: Option<usize> = env_opt("HYPERVISOR_TEST_UNSET_LIMIT").unwrap();
        assert_eq!(v, None);
        assert_eq!(env_parse("HYPERVISOR_TEST_UNSET_LIMIT", 7usize).unwrap(), 7);
    }
}
