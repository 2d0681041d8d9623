//! rollcall-consul — Consul agent HTTP API client for Rollcall.
//!
//! Implements `rollcall_catalog::CoordinationClient` against the local
//! Consul agent:
//!
//! ```text
//! ConsulClient
//!   ├── register()       → PUT /v1/agent/service/register
//!   ├── deregister()     → PUT /v1/agent/service/deregister/<id>
//!   ├── update_ttl()     → PUT /v1/agent/check/update/<check_id>
//!   └── health_service() → GET /v1/health/service/<name>?passing&index&wait
//! ```
//!
//! Each call opens its own HTTP/1.1 connection, so a long-running
//! blocking query never delays a heartbeat issued concurrently.

pub mod client;
pub mod wire;

pub use client::{ConsulClient, ConsulConfig};
