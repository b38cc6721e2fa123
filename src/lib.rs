//! Transparent HTTP/HTTPS Forward Proxy with HAR Egress
//!
//! Forwards each client request to the upstream named in its absolute URI
//! and, in parallel, pushes one HAR-shaped datapoint per completed exchange
//! to an external analytics collector.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌────────────────────────────────────────────────┐
//!                         │                 FORWARD PROXY                  │
//!                         │                                                │
//!   Client Request        │  ┌──────────┐   ┌──────────┐   ┌────────────┐ │
//!   ──────────────────────┼─▶│   net    │──▶│   gate   │──▶│ lifecycle  │ │
//!                         │  │front ends│   │admission │   │  engine    │ │
//!                         │  └──────────┘   └──────────┘   └─────┬──────┘ │
//!                         │                                      │        │
//!                         │                                      ▼        │
//!   Client Response       │  ┌──────────┐                  ┌────────────┐ │
//!   ◀─────────────────────┼──│  meter   │◀─────────────────│  upstream  │◀┼── Upstream
//!                         │  │body tee  │                  │   client   │ │    Server
//!                         │  └──────────┘                  └────────────┘ │
//!                         │                                               │
//!                         │  ┌─────────────────────────────────────────┐  │
//!                         │  │         Per-Request Side Channel        │  │
//!                         │  │  ┌──────┐  ┌───────┐  ┌──────────────┐  │  │
//!                         │  │  │ dns  │  │  har  │  │    egress    │──┼──┼─▶ Collector
//!                         │  │  │ pool │  │builder│  │ push channel │  │  │
//!                         │  │  └──────┘  └───────┘  └──────────────┘  │  │
//!                         │  └─────────────────────────────────────────┘  │
//!                         └───────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod net;
pub mod proxy;

// Per-request side channel
pub mod dns;
pub mod egress;
pub mod har;

// Cross-cutting concerns
pub mod observability;

pub use config::{Cli, ProxyConfig};
pub use proxy::engine::LifecycleEngine;
