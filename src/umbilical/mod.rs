//! Umbilical Module
//!
//! The narrow channel between running worker containers and the application
//! master: workers pull their task assignment once and report progress
//! through strictly sequenced heartbeats.
//!
//! ## Architecture Overview
//! 1. **Pull-based handoff**: the upstream scheduler registers containers and
//!    assignments; each worker pulls its own `TaskSpec` via `get_task`, which
//!    delivers a given assignment at most once.
//! 2. **Heartbeat sequencing**: per container, request ids must advance by
//!    exactly one. An exact duplicate replays the cached previous response;
//!    a gap is a fault. This makes worker-side retries safe without making
//!    delivery at-least-once.
//! 3. **Callback discipline**: every upstream callback runs outside the
//!    registry's critical sections, so the upstream may call back into the
//!    dispatch layer freely.
//!
//! ## Submodules
//! - **`protocol`**: wire types and endpoint constants.
//! - **`context`**: the upstream collaborator interface.
//! - **`endpoint`**: transport-independent umbilical semantics.
//! - **`handlers`**: axum adapters serving the endpoint over HTTP.
//! - **`service`**: service lifecycle plus the upstream registration API.
//! - **`client`**: worker-side HTTP client with transport retries.

pub mod client;
pub mod context;
pub mod endpoint;
pub mod handlers;
pub mod protocol;
pub mod service;

#[cfg(test)]
mod tests;
