//! End-to-end membership scenarios against the in-process catalog.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use rollcall_agent::registration;
use rollcall_agent::{Agent, AgentConfig, AgentError, Console, MembershipWatcher, WatchMode, console};
use rollcall_catalog::{
    CheckStatus, CoordinationClient, HealthCheck, MemoryCatalog, ServiceInstance,
};

fn local_config() -> AgentConfig {
    AgentConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        ..AgentConfig::default()
    }
}

fn peer(id: &str, address: &str, port: u16, ttl: Duration) -> ServiceInstance {
    ServiceInstance {
        id: id.to_string(),
        name: "mycluster".to_string(),
        tags: BTreeSet::from(["login".to_string()]),
        address: address.to_string(),
        port,
        check: HealthCheck {
            check_id: format!("service:{id}"),
            ttl,
            deregister_after: ttl,
            tls_skip_verify: true,
            initial_status: CheckStatus::Passing,
        },
    }
}

#[tokio::test(start_paused = true)]
async fn registration_lists_instance_with_critical_check() {
    let catalog = MemoryCatalog::new();
    let instance = registration::build_instance(&AgentConfig::default(), 53211).unwrap();

    registration::register(&catalog, &instance).await.unwrap();

    let services = catalog.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "svc_53211");
    assert_eq!(services[0].name, "mycluster");
    assert_eq!(services[0].port, 53211);
    assert_eq!(
        catalog.check_status("service:svc_53211"),
        Some(CheckStatus::Critical)
    );
}

#[tokio::test(start_paused = true)]
async fn agent_registers_its_bound_port() {
    let catalog = MemoryCatalog::new();
    let agent = Agent::start(local_config(), Arc::new(catalog.clone()), Console::buffer())
        .await
        .unwrap();

    let registered = catalog.service(&agent.instance().id).unwrap();
    assert_eq!(registered.name, "mycluster");
    assert_eq!(registered.port, agent.port());
    assert_eq!(registered.id, format!("svc_{}", agent.port()));

    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn one_passing_update_within_first_period() {
    let catalog = MemoryCatalog::new();
    let agent = Agent::start(local_config(), Arc::new(catalog.clone()), Console::buffer())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(4900)).await;

    let updates = catalog.ttl_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status, CheckStatus::Passing);
    assert_eq!(updates[0].check_id, agent.instance().check.check_id);

    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ttl_update_errors_terminate_after_bounded_retries() {
    let catalog = MemoryCatalog::new();
    catalog.fail_next_ttl_updates(usize::MAX);

    let agent = Agent::start(local_config(), Arc::new(catalog.clone()), Console::buffer())
        .await
        .unwrap();
    let err = agent.run_until(std::future::pending()).await.unwrap_err();

    assert!(matches!(err, AgentError::Heartbeat { attempts: 4, .. }));
    assert_eq!(catalog.ttl_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn ttl_update_error_fails_fast_without_retries() {
    let catalog = MemoryCatalog::new();
    catalog.fail_next_ttl_updates(1);
    let mut config = local_config();
    config.heartbeat.max_retries = 0;

    let agent = Agent::start(config, Arc::new(catalog.clone()), Console::buffer())
        .await
        .unwrap();
    let err = agent.run_until(std::future::pending()).await.unwrap_err();

    assert!(matches!(err, AgentError::Heartbeat { attempts: 1, .. }));
    assert_eq!(catalog.ttl_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_delivery_prints_one_line_per_member() {
    let catalog = MemoryCatalog::new();
    catalog
        .register(&peer("svc_9001", "10.0.0.5", 9001, Duration::from_secs(600)))
        .await
        .unwrap();

    let console = Console::buffer();
    let (events_tx, events_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = MembershipWatcher::new(Arc::new(catalog.clone()), &local_config(), events_tx);

    let watch_task = tokio::spawn(watcher.run(shutdown_rx));
    let present_task = tokio::spawn(console::present(events_rx, console.clone()));

    tokio::time::sleep(Duration::from_secs(10)).await;
    shutdown_tx.send(true).unwrap();
    watch_task.await.unwrap();
    present_task.await.unwrap();

    let lines = console.lines();
    let matching: Vec<&String> = lines.iter().filter(|l| l.contains("10.0.0.5:9001")).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(
        matching[0],
        "member observed: mycluster/svc_9001 10.0.0.5:9001 [login] passing"
    );
}

#[tokio::test(start_paused = true)]
async fn diff_mode_reports_join_and_leave() {
    let catalog = MemoryCatalog::new();
    let console = Console::buffer();
    let mut config = local_config();
    config.watch.mode = WatchMode::Diff;

    let agent = Agent::start(config, Arc::new(catalog.clone()), console.clone())
        .await
        .unwrap();
    let own_id = agent.instance().id.clone();

    let other = Agent::start(local_config(), Arc::new(catalog.clone()), Console::buffer())
        .await
        .unwrap();
    let other_id = other.instance().id.clone();

    tokio::time::sleep(Duration::from_secs(1)).await;
    other.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let lines = console.lines();
    assert!(lines.iter().any(|l| l.starts_with(&format!("member joined: mycluster/{own_id} "))));
    assert!(lines.iter().any(|l| l.starts_with(&format!("member joined: mycluster/{other_id} "))));
    assert!(lines.iter().any(|l| l.starts_with(&format!("member left: mycluster/{other_id} "))));
    assert!(!lines.iter().any(|l| l.starts_with(&format!("member left: mycluster/{own_id} "))));

    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_peer_leaves_after_ttl() {
    let catalog = MemoryCatalog::new();
    catalog
        .register(&peer("svc_9001", "10.0.0.5", 9001, Duration::from_secs(8)))
        .await
        .unwrap();

    let console = Console::buffer();
    let mut config = local_config();
    config.watch.mode = WatchMode::Diff;
    let agent = Agent::start(config, Arc::new(catalog.clone()), console.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(
        console
            .lines()
            .iter()
            .any(|l| l == "member joined: mycluster/svc_9001 10.0.0.5:9001 [login] passing")
    );
    assert!(!console.lines().iter().any(|l| l.starts_with("member left")));

    // No heartbeat arrives for the peer: critical at 8s, gone at 16s.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(
        console
            .lines()
            .iter()
            .any(|l| l.starts_with("member left: mycluster/svc_9001 "))
    );
    assert_eq!(catalog.check_status("service:svc_9001"), Some(CheckStatus::Critical));

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(catalog.service("svc_9001").is_none());

    // The agent's own heartbeats keep it registered throughout.
    assert!(catalog.service(&agent.instance().id).is_some());
    agent.shutdown().await.unwrap();
}
