//! Domain types for the service catalog.
//!
//! A `ServiceInstance` is built once at agent startup and never mutated.
//! `MemberEntry` values are transient: they exist for the lifetime of the
//! watch delivery that produced them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::MAX_DURATION;
use crate::error::{CatalogError, CatalogResult};

/// Unique identifier for a registered service instance.
pub type ServiceId = String;

/// Unique identifier for a health check.
pub type CheckId = String;

/// Monotonic change index returned by blocking queries.
pub type WatchIndex = u64;

// ── Check status ───────────────────────────────────────────────────

/// Health status of a TTL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    #[default]
    Critical,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passing" => Ok(CheckStatus::Passing),
            "warning" => Ok(CheckStatus::Warning),
            "critical" => Ok(CheckStatus::Critical),
            other => Err(CatalogError::Decode(format!("unknown check status: {other}"))),
        }
    }
}

// ── Registration ───────────────────────────────────────────────────

/// TTL health check attached to a service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub check_id: CheckId,
    /// The check turns critical when no update arrives within this window.
    pub ttl: Duration,
    /// A check critical for this long gets its service deregistered.
    pub deregister_after: Duration,
    /// Skip transport certificate verification for this check.
    pub tls_skip_verify: bool,
    /// Status the check starts in before the first TTL update.
    pub initial_status: CheckStatus,
}

impl HealthCheck {
    /// Validate the check definition.
    ///
    /// `deregister_after` must not be shorter than `ttl`, otherwise the
    /// instance can be pruned before a heartbeat has a chance to save it.
    pub fn validate(&self) -> CatalogResult<()> {
        validate_identifier("check id", &self.check_id)?;
        if self.ttl.is_zero() {
            return Err(CatalogError::Invalid("check ttl must be positive".into()));
        }
        if self.ttl > MAX_DURATION || self.deregister_after > MAX_DURATION {
            return Err(CatalogError::Invalid(format!(
                "check ttl and deregister_after must not exceed {MAX_DURATION:?}"
            )));
        }
        if self.deregister_after < self.ttl {
            return Err(CatalogError::Invalid(format!(
                "deregister_after ({:?}) must be >= ttl ({:?})",
                self.deregister_after, self.ttl
            )));
        }
        Ok(())
    }
}

/// A service instance as registered with the coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Unique across all concurrently registered instances of `name`.
    pub id: ServiceId,
    /// Logical service name shared by all members.
    pub name: String,
    pub tags: BTreeSet<String>,
    pub address: String,
    pub port: u16,
    pub check: HealthCheck,
}

impl ServiceInstance {
    /// Validate the instance and its check before registration.
    pub fn validate(&self) -> CatalogResult<()> {
        validate_identifier("service id", &self.id)?;
        validate_identifier("service name", &self.name)?;
        if self.address.is_empty() {
            return Err(CatalogError::Invalid("service address is empty".into()));
        }
        if self.port == 0 {
            return Err(CatalogError::Invalid("service port must be > 0".into()));
        }
        self.check.validate()
    }

    /// `address:port` as advertised.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Identifiers travel in URL paths, so they are restricted to a safe set.
fn validate_identifier(what: &str, value: &str) -> CatalogResult<()> {
    if value.is_empty() {
        return Err(CatalogError::Invalid(format!("{what} is empty")));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(CatalogError::Invalid(format!(
            "{what} {value:?} contains unsupported character {c:?}"
        )));
    }
    Ok(())
}

// ── Watch ──────────────────────────────────────────────────────────

/// Predicate for a membership watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthQuery {
    pub service: String,
    /// Only return members whose checks are all passing.
    pub passing_only: bool,
    /// How long a blocking query may wait for a change.
    pub wait: Duration,
}

impl HealthQuery {
    pub fn passing(service: impl Into<String>, wait: Duration) -> Self {
        Self {
            service: service.into(),
            passing_only: true,
            wait,
        }
    }
}

/// One member of a service as seen in a watch delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEntry {
    pub service: String,
    pub id: ServiceId,
    /// Node (coordination agent) the instance is registered on.
    pub node: String,
    pub address: String,
    pub port: u16,
    pub tags: BTreeSet<String>,
    pub status: CheckStatus,
}

impl fmt::Display for MemberEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        write!(
            f,
            "{}/{} {}:{} [{}] {}",
            self.service,
            self.id,
            self.address,
            self.port,
            tags.join(","),
            self.status
        )
    }
}

/// The complete filtered member list at a given index.
///
/// Deliveries are level-triggered: each one carries the whole current
/// set, never a diff against a previous delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub index: WatchIndex,
    pub members: Vec<MemberEntry>,
}
