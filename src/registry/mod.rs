//! Container Registry Module
//!
//! Tracks which worker containers are alive and which task attempt each one
//! is currently executing.
//!
//! ## Architecture Overview
//! The registry is an arena-style double index:
//! 1. **Containers**: `ContainerId -> ContainerSlot`, one entry per live
//!    container, installed on registration and removed on container end.
//! 2. **Attempts**: `TaskAttemptId -> ContainerId`, the fan-in index used by
//!    heartbeats to verify that an attempt really belongs to the caller.
//!
//! All mutations of a slot happen inside that slot's critical section; both
//! tables are read lock-free and re-validated by anyone acting on a snapshot.
//!
//! ## Submodules
//! - **`types`**: identities and assignment material shared across the crate.
//! - **`container_registry`**: the double-index registry and its contract
//!   errors.

pub mod container_registry;
pub mod types;
