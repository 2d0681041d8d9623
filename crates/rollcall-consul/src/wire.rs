//! JSON shapes of the Consul agent API.
//!
//! Consul uses PascalCase field names with a few all-caps acronyms
//! (`ID`, `TTL`, `TLSSkipVerify`) that need explicit renames.

use serde::{Deserialize, Serialize};

use rollcall_catalog::duration::format_duration;
use rollcall_catalog::{CheckStatus, MemberEntry, ServiceInstance};

/// Body of `PUT /v1/agent/service/register`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterBody<'a> {
    #[serde(rename = "ID")]
    pub id: &'a str,
    pub name: &'a str,
    pub tags: Vec<&'a str>,
    pub address: &'a str,
    pub port: u16,
    pub check: CheckBody<'a>,
}

/// TTL check definition attached to a registration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckBody<'a> {
    #[serde(rename = "CheckID")]
    pub check_id: &'a str,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub deregister_critical_service_after: String,
    #[serde(rename = "TLSSkipVerify")]
    pub tls_skip_verify: bool,
    pub status: &'static str,
}

impl<'a> From<&'a ServiceInstance> for RegisterBody<'a> {
    fn from(instance: &'a ServiceInstance) -> Self {
        Self {
            id: &instance.id,
            name: &instance.name,
            tags: instance.tags.iter().map(String::as_str).collect(),
            address: &instance.address,
            port: instance.port,
            check: CheckBody {
                check_id: &instance.check.check_id,
                ttl: format_duration(instance.check.ttl),
                deregister_critical_service_after: format_duration(
                    instance.check.deregister_after,
                ),
                tls_skip_verify: instance.check.tls_skip_verify,
                status: instance.check.initial_status.as_str(),
            },
        }
    }
}

/// Body of `PUT /v1/agent/check/update/<check_id>`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TtlUpdateBody<'a> {
    pub status: &'a str,
    pub output: &'a str,
}

/// One element of `GET /v1/health/service/<name>`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthEntry {
    pub node: NodeBody,
    pub service: ServiceBody,
    #[serde(default)]
    pub checks: Vec<CheckEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeBody {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceBody {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    /// Consul sends `null` for an instance registered without tags.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckEntry {
    pub status: String,
}

impl HealthEntry {
    /// Worst status across all checks of the entry.
    ///
    /// Statuses Consul reports beyond passing/warning/critical
    /// (maintenance) count as critical.
    pub fn aggregated_status(&self) -> CheckStatus {
        self.checks
            .iter()
            .map(|c| c.status.parse().unwrap_or(CheckStatus::Critical))
            .max_by_key(|status| severity(*status))
            .unwrap_or(CheckStatus::Passing)
    }

    pub fn into_member(self) -> MemberEntry {
        let status = self.aggregated_status();
        // An empty service address means "same as the node".
        let address = if self.service.address.is_empty() {
            self.node.address
        } else {
            self.service.address
        };

        MemberEntry {
            service: self.service.service,
            id: self.service.id,
            node: self.node.node,
            address,
            port: self.service.port,
            tags: self.service.tags.unwrap_or_default().into_iter().collect(),
            status,
        }
    }
}

fn severity(status: CheckStatus) -> u8 {
    match status {
        CheckStatus::Passing => 0,
        CheckStatus::Warning => 1,
        CheckStatus::Critical => 2,
    }
}
