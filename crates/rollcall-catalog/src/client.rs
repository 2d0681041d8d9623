//! The coordination client capability.
//!
//! Agents only ever see the coordination service through this trait, so
//! any conforming backend (Consul over HTTP, the in-process
//! `MemoryCatalog`) is substitutable. Implementations must be safe for
//! concurrent use: the heartbeat loop and the membership watcher call
//! into the same client from different tasks.

use std::future::Future;
use std::pin::Pin;

use crate::error::CatalogResult;
use crate::types::{CheckStatus, HealthQuery, ServiceInstance, Snapshot, WatchIndex};

/// Boxed future alias for coordination client results.
pub type CatalogFuture<'a, T> = Pin<Box<dyn Future<Output = CatalogResult<T>> + Send + 'a>>;

/// Narrow interface to a cluster coordination service.
pub trait CoordinationClient: Send + Sync {
    /// Add or replace a service instance together with its check.
    fn register<'a>(&'a self, instance: &'a ServiceInstance) -> CatalogFuture<'a, ()>;

    /// Remove a service instance and its check.
    fn deregister<'a>(&'a self, service_id: &'a str) -> CatalogFuture<'a, ()>;

    /// Set a TTL check's status and reset its expiry clock.
    fn update_ttl<'a>(
        &'a self,
        check_id: &'a str,
        note: &'a str,
        status: CheckStatus,
    ) -> CatalogFuture<'a, ()>;

    /// Blocking query over the members of a service.
    ///
    /// Returns immediately when the current index is newer than `index`,
    /// otherwise waits until a change happens or `query.wait` elapses.
    /// An `index` of 0 never blocks.
    fn health_service<'a>(
        &'a self,
        query: &'a HealthQuery,
        index: WatchIndex,
    ) -> CatalogFuture<'a, Snapshot>;
}
