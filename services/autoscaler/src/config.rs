//! Configuration for the autoscaler.
//!
//! Everything is supplied through `SCALE_*` environment variables with
//! defaults suitable for a small cluster. Durations are given in seconds.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::engine::ScalingPolicy;

/// Which backend holds the cluster-state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    /// Postgres via `DATABASE_URL`. Required when more than one copy of the
    /// loop can run against the same cluster.
    Postgres,
    /// In-process memory. Dev only: state dies with the process and the lock
    /// cannot arbitrate across replicas.
    Memory,
}

/// Autoscaler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the cluster this loop manages; also the state-record key and
    /// the tag value used to find worker instances.
    pub cluster: String,

    /// Address the trigger API listens on.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// How often the periodic tick fires.
    pub tick_interval: Duration,

    /// Scaling thresholds, bounds and cooldowns.
    pub policy: ScalingPolicy,

    /// How long an in-flight action may go unverified before it is abandoned.
    pub action_verify_timeout: Duration,

    /// TTL on the distributed lock.
    pub lock_ttl: Duration,

    /// Fixed wait after evictions before a drain is considered done.
    pub drain_grace: Duration,

    /// Per-call timeout for collaborator requests.
    pub call_timeout: Duration,

    /// Prometheus-compatible metrics API base URL.
    pub metrics_url: String,

    /// Instant query for cluster CPU utilization, in percent.
    pub cpu_query: String,

    /// Instant query for the pending-workload count.
    pub pending_query: String,

    /// Orchestration API server base URL.
    pub orch_url: String,

    /// Accept the orchestration API's self-signed serving certificate.
    pub orch_insecure_tls: bool,

    /// Blob-store key holding the orchestration API bearer token.
    pub api_token_key: String,

    /// Compute provisioner gateway base URL.
    pub compute_url: String,

    /// Blob/config store base URL.
    pub blob_url: String,

    /// Blob-store key holding the cluster join token.
    pub join_token_key: String,

    /// Subnets new workers may be launched into (comma-separated ids).
    pub worker_subnets: Vec<String>,

    /// Address of the cluster server, baked into the node join script.
    pub server_addr: String,

    /// State backend selection.
    pub state_backend: StateBackend,

    /// Postgres connection URL (postgres backend only).
    pub database_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cluster = env_or("SCALE_CLUSTER", "default");

        let listen_addr = env_or("SCALE_LISTEN_ADDR", "127.0.0.1:8087").parse()?;

        let log_level = env_or("SCALE_LOG_LEVEL", "info");

        let tick_interval = env_secs("SCALE_TICK_INTERVAL", 60);

        let policy = ScalingPolicy {
            min_nodes: env_parsed("SCALE_MIN_NODES", 2),
            max_nodes: env_parsed("SCALE_MAX_NODES", 10),
            scale_up_cpu: env_parsed("SCALE_UP_CPU_THRESHOLD", 70.0),
            scale_down_cpu: env_parsed("SCALE_DOWN_CPU_THRESHOLD", 30.0),
            pending_threshold: env_parsed("SCALE_PENDING_THRESHOLD", 0.0),
            scale_up_cooldown: env_secs("SCALE_UP_COOLDOWN", 300),
            scale_down_cooldown: env_secs("SCALE_DOWN_COOLDOWN", 600),
        };
        if policy.min_nodes > policy.max_nodes {
            bail!(
                "SCALE_MIN_NODES ({}) must not exceed SCALE_MAX_NODES ({})",
                policy.min_nodes,
                policy.max_nodes
            );
        }

        let action_verify_timeout = env_secs("SCALE_ACTION_VERIFY_TIMEOUT", 600);
        let lock_ttl = env_secs("SCALE_LOCK_TTL", 300);
        let drain_grace = env_secs("SCALE_DRAIN_GRACE", 10);
        let call_timeout = env_secs("SCALE_CALL_TIMEOUT", 10);

        let server_addr = env_or("SCALE_SERVER_ADDR", "");
        let metrics_url = env_or("SCALE_METRICS_URL", "http://127.0.0.1:30090");
        let cpu_query = env_or(
            "SCALE_CPU_QUERY",
            "100 * avg(1 - rate(node_cpu_seconds_total{mode=\"idle\"}[2m]))",
        );
        let pending_query = env_or(
            "SCALE_PENDING_QUERY",
            "sum(kube_pod_status_phase{phase=\"Pending\"})",
        );

        let orch_url = env_or("SCALE_ORCH_URL", "https://127.0.0.1:6443");
        let orch_insecure_tls = env_bool("SCALE_ORCH_INSECURE_TLS", true);
        let api_token_key = env_or("SCALE_API_TOKEN_KEY", "api-token");

        let compute_url = env_or("SCALE_COMPUTE_URL", "http://127.0.0.1:8600");
        let blob_url = env_or("SCALE_BLOB_URL", "http://127.0.0.1:8700");
        let join_token_key = env_or("SCALE_JOIN_TOKEN_KEY", "node-token");

        let worker_subnets: Vec<String> = env_or("SCALE_WORKER_SUBNETS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let state_backend = match env_or("SCALE_STATE_BACKEND", "postgres").as_str() {
            "postgres" => StateBackend::Postgres,
            "memory" => StateBackend::Memory,
            other => bail!("unknown SCALE_STATE_BACKEND '{other}' (postgres|memory)"),
        };

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/smartscale".to_string());

        Ok(Self {
            cluster,
            listen_addr,
            log_level,
            tick_interval,
            policy,
            action_verify_timeout,
            lock_ttl,
            drain_grace,
            call_timeout,
            metrics_url,
            cpu_query,
            pending_query,
            orch_url,
            orch_insecure_tls,
            api_token_key,
            compute_url,
            blob_url,
            join_token_key,
            worker_subnets,
            server_addr,
            state_backend,
            database_url,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parsed(key, default))
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
