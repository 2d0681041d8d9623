//! rollcall.toml configuration.
//!
//! Every key is optional; an empty file yields the defaults below, which
//! reproduce the classic single-host setup (service `mycluster`, 8s TTL,
//! heartbeat every 5s).
//!
//! ```toml
//! service_name = "mycluster"
//! id_prefix = "svc"
//! tags = ["login"]
//! advertise_address = "127.0.0.1"
//!
//! [consul]
//! address = "127.0.0.1:8500"
//!
//! [check]
//! ttl = "8s"
//! deregister_after = "8s"
//!
//! [heartbeat]
//! max_retries = 3
//!
//! [watch]
//! mode = "snapshot"
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use rollcall_catalog::CheckStatus;
use rollcall_catalog::duration::{MAX_DURATION, MAX_WAIT};

use crate::error::AgentError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Logical service name shared by all members.
    pub service_name: String,
    /// Instance identity is `<id_prefix>_<port>`.
    pub id_prefix: String,
    pub tags: Vec<String>,
    /// Address placed in the registration.
    pub advertise_address: String,
    /// Interface the workload listener binds; the port is always OS-assigned.
    pub bind_address: IpAddr,
    /// Deregister explicitly on graceful shutdown instead of waiting for
    /// TTL expiry.
    pub deregister_on_shutdown: bool,
    pub consul: ConsulSettings,
    pub check: CheckSettings,
    pub heartbeat: HeartbeatSettings,
    pub watch: WatchSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsulSettings {
    pub address: String,
    pub datacenter: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckSettings {
    /// Check identity; `service:<instance id>` when unset.
    pub id: Option<String>,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub ttl: Duration,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub deregister_after: Duration,
    pub tls_skip_verify: bool,
    pub initial_status: CheckStatus,
    /// Output attached to every TTL update.
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSettings {
    /// Tick period; derived from the TTL when unset.
    #[serde(deserialize_with = "duration_str::deserialize_opt")]
    pub interval: Option<Duration>,
    /// Retries per tick before the failure is fatal. 0 fails fast.
    pub max_retries: u32,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub base_backoff: Duration,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchSettings {
    pub mode: WatchMode,
    /// Blocking query wait time.
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub wait: Duration,
    /// Base resubscribe delay after a failed query.
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub retry_interval: Duration,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub max_backoff: Duration,
}

/// How watch deliveries are turned into notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Report every currently healthy member on every delivery.
    #[default]
    Snapshot,
    /// Report only members that joined or left since the previous delivery.
    Diff,
}

impl FromStr for WatchMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(WatchMode::Snapshot),
            "diff" => Ok(WatchMode::Diff),
            other => Err(AgentError::Config(format!(
                "unknown watch mode {other:?} (expected \"snapshot\" or \"diff\")"
            ))),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: "mycluster".to_string(),
            id_prefix: "svc".to_string(),
            tags: vec!["login".to_string()],
            advertise_address: "127.0.0.1".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            deregister_on_shutdown: true,
            consul: ConsulSettings::default(),
            check: CheckSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            watch: WatchSettings::default(),
        }
    }
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            datacenter: None,
            token: None,
        }
    }
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            id: None,
            ttl: Duration::from_secs(8),
            deregister_after: Duration::from_secs(8),
            tls_skip_verify: true,
            initial_status: CheckStatus::Critical,
            note: "online".to_string(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: None,
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            mode: WatchMode::Snapshot,
            wait: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(180),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, AgentError> {
        toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Heartbeat period: configured, or `ttl / 1.6` (5s for an 8s TTL).
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
            .interval
            .unwrap_or_else(|| self.check.ttl.saturating_mul(5) / 8)
    }

    /// Reject configurations the agent cannot run safely with.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.service_name.is_empty() {
            return Err(AgentError::Config("service_name is empty".into()));
        }
        if self.id_prefix.is_empty() {
            return Err(AgentError::Config("id_prefix is empty".into()));
        }
        if self.advertise_address.is_empty() {
            return Err(AgentError::Config("advertise_address is empty".into()));
        }
        if let Some(dc) = &self.consul.datacenter {
            if dc.is_empty() || !dc.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)) {
                return Err(AgentError::Config(format!(
                    "consul.datacenter {dc:?} may only contain letters, digits, '-', '_' and '.'"
                )));
            }
        }
        for (key, value) in self.durations() {
            if value > MAX_DURATION {
                return Err(AgentError::Config(format!(
                    "{key} ({value:?}) exceeds {MAX_DURATION:?}"
                )));
            }
        }
        if self.watch.wait > MAX_WAIT {
            return Err(AgentError::Config(format!(
                "watch.wait ({:?}) exceeds {MAX_WAIT:?}",
                self.watch.wait
            )));
        }
        if self.check.ttl.is_zero() {
            return Err(AgentError::Config("check.ttl must be positive".into()));
        }
        if self.check.deregister_after < self.check.ttl {
            return Err(AgentError::Config(format!(
                "check.deregister_after ({:?}) must be >= check.ttl ({:?})",
                self.check.deregister_after, self.check.ttl
            )));
        }

        let interval = self.heartbeat_interval();
        if interval.is_zero() || interval >= self.check.ttl {
            return Err(AgentError::Config(format!(
                "heartbeat interval ({interval:?}) must be > 0 and < check.ttl ({:?})",
                self.check.ttl
            )));
        }
        if self.heartbeat.max_backoff < self.heartbeat.base_backoff {
            return Err(AgentError::Config(
                "heartbeat.max_backoff must be >= heartbeat.base_backoff".into(),
            ));
        }
        if self.watch.retry_interval.is_zero() || self.watch.max_backoff < self.watch.retry_interval
        {
            return Err(AgentError::Config(
                "watch.retry_interval must be > 0 and <= watch.max_backoff".into(),
            ));
        }
        Ok(())
    }

    /// Configured durations, by key.
    fn durations(&self) -> Vec<(&'static str, Duration)> {
        let mut durations = vec![
            ("check.ttl", self.check.ttl),
            ("check.deregister_after", self.check.deregister_after),
            ("heartbeat.base_backoff", self.heartbeat.base_backoff),
            ("heartbeat.max_backoff", self.heartbeat.max_backoff),
            ("watch.retry_interval", self.watch.retry_interval),
            ("watch.max_backoff", self.watch.max_backoff),
        ];
        if let Some(interval) = self.heartbeat.interval {
            durations.push(("heartbeat.interval", interval));
        }
        durations
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    use rollcall_catalog::duration::parse_duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_duration(&s).ok_or_else(|| D::Error::custom(format!("invalid duration {s:?}")))
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        deserialize(d).map(Some)
    }
}
