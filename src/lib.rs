//! Crucible: a self-hosted orchestrator that runs declared programs inside
//! isolated Docker containers.
//!
//! Programs (one-shot scripts and long-running bots) are declared in a YAML
//! catalog. A submission is validated against the catalog, admitted under a
//! global concurrency cap, and driven to a terminal state by a worker task
//! that launches a container, streams its output, and enforces a deadline.
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                   crucible                         │
//! │                                                    │
//! │  REST API (axum)                                   │
//! │    POST /executions ──▶ Executor                   │
//! │                           │ catalog lookup         │
//! │                           │ admission (slot cap)   │
//! │                           │ image provisioning     │
//! │                           ▼                        │
//! │                         worker ──▶ DockerDriver    │
//! │                           │          (bollard /    │
//! │                           │           compose)     │
//! │                           ▼                        │
//! │                     ExecutionStore                 │
//! │         queued → running → completed/failed/timeout│
//! └───────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod docker;
pub mod error;
pub mod executor;
pub mod report;
