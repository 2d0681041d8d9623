//! Building and publishing the agent's own registration.

use tracing::{info, warn};

use rollcall_catalog::{CoordinationClient, HealthCheck, ServiceInstance};

use crate::config::AgentConfig;
use crate::error::AgentError;

/// Instance identity for a bound port: `<id_prefix>_<port>`.
pub fn instance_id(config: &AgentConfig, port: u16) -> String {
    format!("{}_{}", config.id_prefix, port)
}

/// Describe this process as a service instance on `port`.
pub fn build_instance(config: &AgentConfig, port: u16) -> Result<ServiceInstance, AgentError> {
    let id = instance_id(config, port);
    let check_id = config
        .check
        .id
        .clone()
        .unwrap_or_else(|| format!("service:{id}"));

    let instance = ServiceInstance {
        id,
        name: config.service_name.clone(),
        tags: config.tags.iter().cloned().collect(),
        address: config.advertise_address.clone(),
        port,
        check: HealthCheck {
            check_id,
            ttl: config.check.ttl,
            deregister_after: config.check.deregister_after,
            tls_skip_verify: config.check.tls_skip_verify,
            initial_status: config.check.initial_status,
        },
    };

    instance
        .validate()
        .map_err(|e| AgentError::Config(e.to_string()))?;
    Ok(instance)
}

/// Publish the instance. Any failure is returned as `AgentError::Register`.
pub async fn register(
    client: &dyn CoordinationClient,
    instance: &ServiceInstance,
) -> Result<(), AgentError> {
    client
        .register(instance)
        .await
        .map_err(AgentError::Register)?;

    info!(
        service_id = %instance.id,
        service = %instance.name,
        endpoint = %instance.endpoint(),
        check_id = %instance.check.check_id,
        "service registered"
    );
    Ok(())
}

/// Remove the instance from the catalog.
pub async fn deregister(client: &dyn CoordinationClient, service_id: &str) -> Result<(), AgentError> {
    match client.deregister(service_id).await {
        Ok(()) => {
            info!(%service_id, "service deregistered");
            Ok(())
        }
        Err(e) => {
            warn!(%service_id, error = %e, "deregistration failed");
            Err(AgentError::Deregister(e))
        }
    }
}
