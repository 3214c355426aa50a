//! Local Container Launcher Module
//!
//! In-process stand-in for an external resource manager: launch requests run
//! task payloads on a bounded worker pool inside the application master,
//! against the same umbilical contract remote containers use.
//!
//! ## Architecture Overview
//! 1. **Event loop**: launch/stop requests are serialized through one FIFO
//!    drained by a dedicated task.
//! 2. **Worker pool**: payloads execute under a semaphore-bounded pool;
//!    excess launches queue until a slot frees up.
//! 3. **Completion callbacks**: every payload reports exactly one completion
//!    through a single consumer, which keeps lifecycle events serial per
//!    container (`Launched` strictly before `Completed`).
//!
//! ## Submodules
//! - **`types`**: payload traits, launch requests, and lifecycle events.
//! - **`pool`**: the bounded executor with cancellable handles.
//! - **`event_loop`**: the launcher itself.

pub mod event_loop;
pub mod pool;
pub mod types;
