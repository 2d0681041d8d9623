//! rollcall-agent — service membership for a single process.
//!
//! Binds the workload listener, registers the process with the
//! coordination service under a logical service name, keeps the
//! registration alive with TTL heartbeats, and watches the healthy
//! members of the same service.
//!
//! # Architecture
//!
//! ```text
//! Agent::start()
//!   ├── listener::bind()            → OS-assigned port
//!   ├── registration::build_instance() → ServiceInstance (id = <prefix>_<port>)
//!   ├── MembershipWatcher (task)    → blocking queries → MembershipEvent channel
//!   │     └── console::present()    → one line per event
//!   ├── registration::register()    → fatal on failure
//!   ├── HeartbeatLoop (task)        → update_ttl("passing") every ttl/1.6
//!   └── listener::accept_loop()     → placeholder workload
//! ```
//!
//! All background tasks share one shutdown signal. Heartbeat and accept
//! failures are fatal and surface through `Agent::run_until`; watch
//! failures are retried forever with backoff.

pub mod agent;
pub mod config;
pub mod console;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod registration;
pub mod watcher;

pub use agent::Agent;
pub use config::{AgentConfig, WatchMode};
pub use console::Console;
pub use error::AgentError;
pub use heartbeat::HeartbeatLoop;
pub use watcher::{MembershipEvent, MembershipWatcher};
