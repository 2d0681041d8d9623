//! In-process coordination service.
//!
//! `MemoryCatalog` implements `CoordinationClient` entirely in memory with
//! the same check semantics as a real coordination agent:
//!
//! - a TTL check that receives no update within `ttl` turns critical;
//! - a service whose check stays critical for `deregister_after` is removed;
//! - every state change bumps a global index and wakes blocked queries.
//!
//! Time is read from `tokio::time::Instant`, so tests running on a paused
//! clock observe expiry deterministically. State is evaluated lazily on
//! every access; blocked queries additionally wake at the next expiry or
//! reap deadline so watchers see those transitions without polling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{CatalogFuture, CoordinationClient};
use crate::duration::MAX_WAIT;
use crate::error::{CatalogError, CatalogResult};
use crate::types::*;

/// A successful TTL update as recorded by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlUpdate {
    pub check_id: CheckId,
    pub note: String,
    pub status: CheckStatus,
    pub at: Instant,
}

/// Shared, cloneable in-memory catalog.
#[derive(Debug, Clone)]
pub struct MemoryCatalog {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    node: String,
    state: Mutex<CatalogState>,
    index_tx: watch::Sender<WatchIndex>,
}

#[derive(Debug, Default)]
struct CatalogState {
    index: WatchIndex,
    services: BTreeMap<ServiceId, Registration>,
    faults: Faults,
    ttl_log: Vec<TtlUpdate>,
    ttl_attempts: usize,
    register_calls: usize,
    query_calls: usize,
}

/// Pending injected failures, consumed one per call.
#[derive(Debug, Default)]
struct Faults {
    registrations: usize,
    ttl_updates: usize,
    queries: usize,
}

#[derive(Debug)]
struct Registration {
    instance: ServiceInstance,
    status: CheckStatus,
    output: String,
    last_update: Instant,
    critical_since: Option<Instant>,
}

impl Registration {
    fn expiry(&self) -> Instant {
        self.last_update + self.instance.check.ttl
    }

    fn reap_at(&self) -> Option<Instant> {
        self.critical_since
            .map(|since| since + self.instance.check.deregister_after)
    }

    /// The next instant at which this registration changes on its own.
    fn next_deadline(&self) -> Instant {
        self.reap_at().unwrap_or_else(|| self.expiry())
    }

    fn to_member(&self, node: &str) -> MemberEntry {
        MemberEntry {
            service: self.instance.name.clone(),
            id: self.instance.id.clone(),
            node: node.to_string(),
            address: self.instance.address.clone(),
            port: self.instance.port,
            tags: self.instance.tags.clone(),
            status: self.status,
        }
    }
}

impl CatalogState {
    /// Apply TTL expiry and deregister-after reaping up to `now`.
    ///
    /// Returns whether anything changed.
    fn reap(&mut self, now: Instant) -> bool {
        let mut changed = false;

        for (id, reg) in self.services.iter_mut() {
            if reg.critical_since.is_none() && now >= reg.expiry() {
                warn!(service_id = %id, check_id = %reg.instance.check.check_id, "ttl check expired");
                reg.status = CheckStatus::Critical;
                reg.output = "TTL expired".to_string();
                reg.critical_since = Some(reg.expiry());
                changed = true;
            }
        }

        let before = self.services.len();
        self.services.retain(|id, reg| match reg.reap_at() {
            Some(at) if now >= at => {
                info!(service_id = %id, "deregistered critical service");
                false
            }
            _ => true,
        });

        changed || self.services.len() != before
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.services.values().map(Registration::next_deadline).min()
    }

    fn snapshot(&self, query: &HealthQuery, node: &str) -> Snapshot {
        let members = self
            .services
            .values()
            .filter(|reg| reg.instance.name == query.service)
            .filter(|reg| !query.passing_only || reg.status == CheckStatus::Passing)
            .map(|reg| reg.to_member(node))
            .collect();

        Snapshot {
            index: self.index,
            members,
        }
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    /// Create an empty catalog whose members report node `"memory"`.
    pub fn new() -> Self {
        Self::with_node("memory")
    }

    /// Create an empty catalog with a custom node name.
    pub fn with_node(node: impl Into<String>) -> Self {
        let state = CatalogState {
            index: 1,
            ..CatalogState::default()
        };
        let (index_tx, _) = watch::channel(state.index);

        Self {
            inner: Arc::new(Inner {
                node: node.into(),
                state: Mutex::new(state),
                index_tx,
            }),
        }
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Fail the next `n` registrations as if the service were unreachable.
    pub fn fail_next_registrations(&self, n: usize) {
        self.lock().faults.registrations = n;
    }

    /// Fail the next `n` TTL updates as if the service were unreachable.
    pub fn fail_next_ttl_updates(&self, n: usize) {
        self.lock().faults.ttl_updates = n;
    }

    /// Fail the next `n` health queries as if the connection dropped.
    pub fn fail_next_queries(&self, n: usize) {
        self.lock().faults.queries = n;
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Currently registered instances, after applying expiry.
    pub fn services(&self) -> Vec<ServiceInstance> {
        self.lock_current()
            .services
            .values()
            .map(|reg| reg.instance.clone())
            .collect()
    }

    /// Look up a registered instance by ID.
    pub fn service(&self, service_id: &str) -> Option<ServiceInstance> {
        self.lock_current()
            .services
            .get(service_id)
            .map(|reg| reg.instance.clone())
    }

    /// Current status of a check, if its service is still registered.
    pub fn check_status(&self, check_id: &str) -> Option<CheckStatus> {
        self.lock_current()
            .services
            .values()
            .find(|reg| reg.instance.check.check_id == check_id)
            .map(|reg| reg.status)
    }

    /// All successful TTL updates, oldest first.
    pub fn ttl_updates(&self) -> Vec<TtlUpdate> {
        self.lock().ttl_log.clone()
    }

    /// Number of TTL update calls, including failed ones.
    pub fn ttl_attempts(&self) -> usize {
        self.lock().ttl_attempts
    }

    /// Number of register calls, including failed ones.
    pub fn register_calls(&self) -> usize {
        self.lock().register_calls
    }

    /// Number of health queries issued, including failed ones.
    pub fn query_calls(&self) -> usize {
        self.lock().query_calls
    }

    /// Current change index.
    pub fn index(&self) -> WatchIndex {
        self.lock_current().index
    }

    // ── Internals ──────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Lock the state with expiry applied up to now.
    fn lock_current(&self) -> MutexGuard<'_, CatalogState> {
        let mut state = self.lock();
        if state.reap(Instant::now()) {
            self.bump(&mut state);
        }
        state
    }

    fn bump(&self, state: &mut CatalogState) {
        state.index += 1;
        self.inner.index_tx.send_replace(state.index);
    }

    fn do_register(&self, instance: &ServiceInstance) -> CatalogResult<()> {
        let mut state = self.lock_current();
        state.register_calls += 1;

        if state.faults.registrations > 0 {
            state.faults.registrations -= 1;
            return Err(CatalogError::Unreachable("injected registration failure".into()));
        }

        instance.validate()?;

        if let Some(owner) = state
            .services
            .values()
            .find(|reg| {
                reg.instance.check.check_id == instance.check.check_id
                    && reg.instance.id != instance.id
            })
            .map(|reg| reg.instance.id.clone())
        {
            return Err(CatalogError::Invalid(format!(
                "check {} already belongs to service {owner}",
                instance.check.check_id
            )));
        }

        let now = Instant::now();
        let status = instance.check.initial_status;
        let reg = Registration {
            instance: instance.clone(),
            status,
            output: String::new(),
            last_update: now,
            critical_since: (status == CheckStatus::Critical).then_some(now),
        };

        state.services.insert(instance.id.clone(), reg);
        self.bump(&mut state);

        info!(
            service_id = %instance.id,
            service = %instance.name,
            endpoint = %instance.endpoint(),
            %status,
            "service registered"
        );
        Ok(())
    }

    fn do_deregister(&self, service_id: &str) -> CatalogResult<()> {
        let mut state = self.lock_current();
        if state.services.remove(service_id).is_none() {
            return Err(CatalogError::ServiceNotFound(service_id.to_string()));
        }
        self.bump(&mut state);
        info!(%service_id, "service deregistered");
        Ok(())
    }

    fn do_update_ttl(&self, check_id: &str, note: &str, status: CheckStatus) -> CatalogResult<()> {
        let mut guard = self.lock_current();
        let state = &mut *guard;
        state.ttl_attempts += 1;

        if state.faults.ttl_updates > 0 {
            state.faults.ttl_updates -= 1;
            return Err(CatalogError::Unreachable("injected ttl update failure".into()));
        }

        let reg = state
            .services
            .values_mut()
            .find(|reg| reg.instance.check.check_id == check_id)
            .ok_or_else(|| CatalogError::CheckNotFound(check_id.to_string()))?;

        let now = Instant::now();
        let changed = reg.status != status || reg.output != note;
        reg.status = status;
        reg.output = note.to_string();
        reg.last_update = now;
        reg.critical_since = match status {
            CheckStatus::Critical => reg.critical_since.or(Some(now)),
            _ => None,
        };

        state.ttl_log.push(TtlUpdate {
            check_id: check_id.to_string(),
            note: note.to_string(),
            status,
            at: now,
        });

        if changed {
            self.bump(state);
        }
        debug!(%check_id, %status, "ttl updated");
        Ok(())
    }

    async fn do_health_service(
        &self,
        query: &HealthQuery,
        index: WatchIndex,
    ) -> CatalogResult<Snapshot> {
        let mut index_rx = self.inner.index_tx.subscribe();
        let wait_until = Instant::now() + query.wait.min(MAX_WAIT);

        {
            let mut state = self.lock();
            state.query_calls += 1;
            if state.faults.queries > 0 {
                state.faults.queries -= 1;
                return Err(CatalogError::Unreachable("injected query failure".into()));
            }
        }

        loop {
            let (snapshot, deadline) = {
                let state = self.lock_current();
                (state.snapshot(query, &self.inner.node), state.next_deadline())
            };

            if index == 0 || snapshot.index > index || Instant::now() >= wait_until {
                return Ok(snapshot);
            }

            let wake = deadline.map_or(wait_until, |d| d.min(wait_until));
            tokio::select! {
                _ = index_rx.changed() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

impl CoordinationClient for MemoryCatalog {
    fn register<'a>(&'a self, instance: &'a ServiceInstance) -> CatalogFuture<'a, ()> {
        Box::pin(async move { self.do_register(instance) })
    }

    fn deregister<'a>(&'a self, service_id: &'a str) -> CatalogFuture<'a, ()> {
        Box::pin(async move { self.do_deregister(service_id) })
    }

    fn update_ttl<'a>(
        &'a self,
        check_id: &'a str,
        note: &'a str,
        status: CheckStatus,
    ) -> CatalogFuture<'a, ()> {
        Box::pin(async move { self.do_update_ttl(check_id, note, status) })
    }

    fn health_service<'a>(
        &'a self,
        query: &'a HealthQuery,
        index: WatchIndex,
    ) -> CatalogFuture<'a, Snapshot> {
        Box::pin(self.do_health_service(query, index))
    }
}
