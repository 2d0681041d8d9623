//! Membership watcher — supervised blocking-query subscription.
//!
//! The watcher repeatedly issues a blocking health query for the service
//! name (passing members only) and turns each accepted delivery into
//! `MembershipEvent`s on a channel. Presentation lives on the other end
//! of the channel (`console::present`).
//!
//! Delivery handling follows the coordination service's watch plan:
//!
//! - an unchanged index is ignored, and index 0 counts as 1;
//! - an index that went backwards resets the tracked index to 0;
//! - a member list equal to the previous one is ignored.
//!
//! Query failures never stop the watcher: it resubscribes after
//! `retry_interval * failures²`, capped at `max_backoff`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use rollcall_catalog::{CoordinationClient, HealthQuery, MemberEntry, Snapshot, WatchIndex};

use crate::config::{AgentConfig, WatchMode};

/// A notification derived from a watch delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// The member is healthy as of the latest delivery.
    Observed(MemberEntry),
    /// The member was absent from the previous delivery.
    Joined(MemberEntry),
    /// The member is absent from the latest delivery.
    Left(MemberEntry),
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipEvent::Observed(m) => write!(f, "member observed: {m}"),
            MembershipEvent::Joined(m) => write!(f, "member joined: {m}"),
            MembershipEvent::Left(m) => write!(f, "member left: {m}"),
        }
    }
}

/// Tracks the last accepted delivery and derives events from new ones.
#[derive(Debug)]
pub struct SnapshotTracker {
    mode: WatchMode,
    last_index: Option<WatchIndex>,
    last_members: Option<Vec<MemberEntry>>,
}

impl SnapshotTracker {
    pub fn new(mode: WatchMode) -> Self {
        Self {
            mode,
            last_index: None,
            last_members: None,
        }
    }

    /// Index to pass to the next blocking query.
    pub fn index(&self) -> WatchIndex {
        self.last_index.unwrap_or(0)
    }

    /// Process one delivery, returning the events it produces.
    pub fn observe(&mut self, snapshot: Snapshot) -> Vec<MembershipEvent> {
        // Index 0 would turn the next query into a non-blocking one.
        let index = snapshot.index.max(1);
        if self.last_index == Some(index) {
            return Vec::new();
        }

        self.last_index = Some(match self.last_index {
            Some(prev) if index < prev => {
                debug!(prev, index, "watch index went backwards, resetting");
                0
            }
            _ => index,
        });

        if self.last_members.as_ref() == Some(&snapshot.members) {
            return Vec::new();
        }

        let events = match self.mode {
            WatchMode::Snapshot => snapshot
                .members
                .iter()
                .cloned()
                .map(MembershipEvent::Observed)
                .collect(),
            WatchMode::Diff => diff(self.last_members.as_deref().unwrap_or(&[]), &snapshot.members),
        };

        self.last_members = Some(snapshot.members);
        events
    }
}

/// Members that joined or left between two deliveries, keyed by identity.
fn diff(previous: &[MemberEntry], current: &[MemberEntry]) -> Vec<MembershipEvent> {
    let before: BTreeMap<&str, &MemberEntry> =
        previous.iter().map(|m| (m.id.as_str(), m)).collect();
    let after: BTreeMap<&str, &MemberEntry> = current.iter().map(|m| (m.id.as_str(), m)).collect();

    let joined = current
        .iter()
        .filter(|m| !before.contains_key(m.id.as_str()))
        .cloned()
        .map(MembershipEvent::Joined);
    let left = previous
        .iter()
        .filter(|m| !after.contains_key(m.id.as_str()))
        .cloned()
        .map(MembershipEvent::Left);

    joined.chain(left).collect()
}

/// Delay before the next query after `failures` consecutive errors.
pub fn resubscribe_delay(retry_interval: Duration, failures: u32, max: Duration) -> Duration {
    retry_interval
        .saturating_mul(failures.saturating_mul(failures))
        .min(max)
}

/// Long-lived subscription to the healthy members of a service.
pub struct MembershipWatcher {
    client: Arc<dyn CoordinationClient>,
    query: HealthQuery,
    tracker: SnapshotTracker,
    retry_interval: Duration,
    max_backoff: Duration,
    events: mpsc::Sender<MembershipEvent>,
}

impl MembershipWatcher {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        config: &AgentConfig,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Self {
        Self {
            client,
            query: HealthQuery::passing(config.service_name.clone(), config.watch.wait),
            tracker: SnapshotTracker::new(config.watch.mode),
            retry_interval: config.watch.retry_interval,
            max_backoff: config.watch.max_backoff,
            events,
        }
    }

    /// Run until shutdown is signalled or the event receiver goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(service = %self.query.service, "membership watch started");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let index = self.tracker.index();
            let result = tokio::select! {
                result = self.client.health_service(&self.query, index) => result,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(snapshot) => {
                    failures = 0;
                    let index = snapshot.index;
                    let count = snapshot.members.len();
                    let events = self.tracker.observe(snapshot);
                    debug!(index, members = count, events = events.len(), "watch delivery");

                    for event in events {
                        if self.events.send(event).await.is_err() {
                            debug!("membership event receiver dropped");
                            return;
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = resubscribe_delay(self.retry_interval, failures, self.max_backoff);
                    warn!(
                        service = %self.query.service,
                        error = %e,
                        failures,
                        retry_in = ?delay,
                        "membership watch failed, resubscribing"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!(service = %self.query.service, "membership watch stopped");
    }
}
