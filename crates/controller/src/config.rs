//! Engine configuration from `RELAY_*` environment variables.

use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_MAX_WRAPPED_BYTES: usize = 512_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} as {expected}")]
    Invalid { var: &'static str, value: String, expected: &'static str },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    pub max_wrapped_bytes: usize,
    pub workers: usize,
    pub queue_cap: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub conflict_attempts: u32,
    pub op_timeout_secs: u64,
    pub resync_secs: u64,
    pub status_poll_secs: u64,
    /// kubeconfig context holding policies and workload objects; `None` infers.
    pub wds_context: Option<String>,
    /// kubeconfig context where wrapped workloads are written; defaults to the WDS one.
    pub transport_context: Option<String>,
    /// `group/version/Kind` keys of the workload kinds to watch.
    pub workload_kinds: Vec<String>,
    pub cluster_kind: String,
    pub verbosity: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_wrapped_bytes: DEFAULT_MAX_WRAPPED_BYTES,
            workers: 4,
            queue_cap: 2048,
            backoff_base_ms: 5,
            backoff_max_secs: 300,
            conflict_attempts: 5,
            op_timeout_secs: 30,
            resync_secs: 300,
            status_poll_secs: 15,
            wds_context: None,
            transport_context: None,
            workload_kinds: vec!["v1/ConfigMap".into(), "apps/v1/Deployment".into(), "v1/Service".into()],
            cluster_kind: "cluster.open-cluster-management.io/v1/ManagedCluster".into(),
            verbosity: 0,
        }
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, raw: Option<String>, expected: &'static str) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => v.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Invalid { var, value: v, expected }),
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from any variable source; unset or blank variables keep defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut c = Self::default();
        macro_rules! num {
            ($field:ident, $var:literal, $ty:ty) => {
                if let Some(v) = parse_num::<$ty>($var, get($var), stringify!($ty))? {
                    c.$field = v;
                }
            };
        }
        num!(max_wrapped_bytes, "RELAY_MAX_WRAPPED_BYTES", usize);
        num!(workers, "RELAY_WORKERS", usize);
        num!(queue_cap, "RELAY_QUEUE_CAP", usize);
        num!(backoff_base_ms, "RELAY_BACKOFF_BASE_MS", u64);
        num!(backoff_max_secs, "RELAY_BACKOFF_MAX_SECS", u64);
        num!(conflict_attempts, "RELAY_CONFLICT_ATTEMPTS", u32);
        num!(op_timeout_secs, "RELAY_OP_TIMEOUT_SECS", u64);
        num!(resync_secs, "RELAY_RESYNC_SECS", u64);
        num!(status_poll_secs, "RELAY_STATUS_POLL_SECS", u64);
        num!(verbosity, "RELAY_VERBOSITY", u8);
        let text = |var: &str| get(var).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        if let Some(v) = text("RELAY_WDS_CONTEXT") {
            c.wds_context = Some(v);
        }
        if let Some(v) = text("RELAY_TRANSPORT_CONTEXT") {
            c.transport_context = Some(v);
        }
        if let Some(v) = text("RELAY_WORKLOAD_KINDS") {
            c.workload_kinds = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = text("RELAY_CLUSTER_KIND") {
            c.cluster_kind = v;
        }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("RELAY_MAX_WRAPPED_BYTES", self.max_wrapped_bytes as u64),
            ("RELAY_WORKERS", self.workers as u64),
            ("RELAY_QUEUE_CAP", self.queue_cap as u64),
            ("RELAY_CONFLICT_ATTEMPTS", u64::from(self.conflict_attempts)),
            ("RELAY_OP_TIMEOUT_SECS", self.op_timeout_secs),
            ("RELAY_RESYNC_SECS", self.resync_secs),
            ("RELAY_STATUS_POLL_SECS", self.status_poll_secs),
        ];
        match positive.iter().find(|(_, v)| *v == 0) {
            Some((var, _)) => Err(ConfigError::Zero { var: *var }),
            None => Ok(()),
        }
    }

    pub fn op_timeout(&self) -> Duration { Duration::from_secs(self.op_timeout_secs) }
    pub fn resync_interval(&self) -> Duration { Duration::from_secs(self.resync_secs) }
    pub fn status_poll_interval(&self) -> Duration { Duration::from_secs(self.status_poll_secs) }
}
