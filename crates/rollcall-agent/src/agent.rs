//! Agent lifecycle.
//!
//! `Agent::start` brings the process into the service: bind, register,
//! heartbeat, watch. `Agent::shutdown` takes it out again.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rollcall_catalog::{CoordinationClient, ServiceInstance};

use crate::config::AgentConfig;
use crate::console::{self, Console};
use crate::error::AgentError;
use crate::heartbeat::HeartbeatLoop;
use crate::listener;
use crate::registration;
use crate::watcher::MembershipWatcher;

/// Buffered membership events between watcher and presenter.
const EVENT_BUFFER: usize = 64;

/// A registered, heartbeating, watching service member.
pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn CoordinationClient>,
    instance: ServiceInstance,
    shutdown_tx: watch::Sender<bool>,
    fatal_rx: mpsc::Receiver<AgentError>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Agent {
    /// Bind, register and start the background tasks.
    ///
    /// Returns once the registration is accepted. A registration failure
    /// stops anything already spawned and is returned as-is.
    pub async fn start<W>(
        config: AgentConfig,
        client: Arc<dyn CoordinationClient>,
        console: Console<W>,
    ) -> Result<Self, AgentError>
    where
        W: Write + Send + 'static,
    {
        config.validate()?;

        let (tcp, port) = listener::bind(config.bind_address).await?;
        let instance = registration::build_instance(&config, port)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let mut agent = Self {
            config,
            client,
            instance,
            shutdown_tx,
            fatal_rx,
            tasks: Vec::new(),
        };

        let watcher = MembershipWatcher::new(Arc::clone(&agent.client), &agent.config, events_tx);
        agent.spawn("watcher", watcher.run(shutdown_rx.clone()));
        agent.spawn("presenter", console::present(events_rx, console.clone()));

        if let Err(e) = registration::register(agent.client.as_ref(), &agent.instance).await {
            error!(service_id = %agent.instance.id, error = %e, "registration failed");
            agent.stop_tasks().await;
            return Err(e);
        }

        console.line(format_args!(
            "service registered: {} ({}) at {}",
            agent.instance.id,
            agent.instance.name,
            agent.instance.endpoint()
        ));

        let heartbeat = HeartbeatLoop::new(
            Arc::clone(&agent.client),
            agent.instance.check.check_id.clone(),
            &agent.config,
        );
        let rx = shutdown_rx.clone();
        let tx = fatal_tx.clone();
        agent.spawn("heartbeat", async move {
            if let Err(e) = heartbeat.run(rx).await {
                error!(error = %e, "heartbeat loop failed");
                let _ = tx.send(e).await;
            }
        });

        agent.spawn("listener", async move {
            if let Err(e) = listener::accept_loop(tcp, shutdown_rx).await {
                error!(error = %e, "accept loop failed");
                let _ = fatal_tx.send(e).await;
            }
        });

        info!(
            service_id = %agent.instance.id,
            service = %agent.instance.name,
            port,
            "agent started"
        );
        Ok(agent)
    }

    /// The registered instance.
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// The bound listener port.
    pub fn port(&self) -> u16 {
        self.instance.port
    }

    /// Resolve when a background task fails fatally.
    ///
    /// Returns `None` once no task can fail anymore.
    pub async fn wait(&mut self) -> Option<AgentError> {
        self.fatal_rx.recv().await
    }

    /// Run until `signal` resolves or a task fails, then shut down.
    ///
    /// A fatal task error takes precedence over a deregistration error.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let fatal = tokio::select! {
            Some(e) = self.wait() => Some(e),
            _ = signal => {
                info!("shutdown requested");
                None
            }
        };

        let result = self.shutdown().await;
        match fatal {
            Some(e) => Err(e),
            None => result,
        }
    }

    /// Stop all tasks, then deregister if configured.
    pub async fn shutdown(mut self) -> Result<(), AgentError> {
        info!(service_id = %self.instance.id, "agent shutting down");
        self.stop_tasks().await;

        if self.config.deregister_on_shutdown {
            registration::deregister(self.client.as_ref(), &self.instance.id).await?;
        }

        info!(service_id = %self.instance.id, "agent stopped");
        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    async fn stop_tasks(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks.drain(..) {
            match handle.await {
                Ok(()) => debug!(task = name, "task stopped"),
                Err(e) => warn!(task = name, error = %e, "task panicked or was cancelled"),
            }
        }
    }
}
