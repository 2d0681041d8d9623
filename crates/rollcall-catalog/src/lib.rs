//! rollcall-catalog — the service catalog model for Rollcall.
//!
//! Defines what an agent registers (`ServiceInstance` with its attached
//! TTL `HealthCheck`), what a watch delivers (`Snapshot` of
//! `MemberEntry` values), and the narrow `CoordinationClient` capability
//! through which agents talk to the coordination service.
//!
//! # Architecture
//!
//! ```text
//! CoordinationClient (trait, object-safe)
//!   ├── register()        → add/replace instance + check
//!   ├── deregister()      → remove instance + check
//!   ├── update_ttl()      → reset the check's expiry clock
//!   └── health_service()  → blocking query over healthy members
//!
//! MemoryCatalog
//!   └── In-process implementation honoring TTL expiry,
//!       deregister-after reaping, and blocking-query indexes
//! ```
//!
//! The HTTP implementation against a real Consul agent lives in
//! `rollcall-consul`.

pub mod client;
pub mod duration;
pub mod error;
pub mod memory;
pub mod types;

pub use client::{CatalogFuture, CoordinationClient};
pub use error::{CatalogError, CatalogResult};
pub use memory::MemoryCatalog;
pub use types::*;
