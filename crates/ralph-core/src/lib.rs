//! Core engine of the ralph coordinator: dispatches independent coding
//! tasks across a pool of isolated git workspaces, serializes the resulting
//! commits onto an integration branch, gates them through configurable
//! validation checks, and promotes the integration head to the mainline
//! branch.
//!
//! # Architecture
//!
//! ```text
//! Coordinator (dispatch loop)
//!     |
//!     v
//! WorkerPool --- Worker (workspace + agent) --- commits on worker branch
//!     |                                              |
//!     |                                              v
//!     |                                         MergeQueue (serial cherry-pick)
//!     |                                              |
//!     |                                              v   integration head
//!     |                                         ValidationQueue (checks + fix)
//!     |                                              |
//!     |                                              v
//!     +----------------------------------------MainlineSync (ff / update-ref)
//! ```
//!
//! Every stage emits typed events on the [`events::EventBus`]; consumers
//! (CLI, TUI) observe state through the event stream and never drive it.

pub mod agent;
pub mod ansi;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod git;
pub mod mainline;
pub mod merge;
pub mod tracker;
pub mod validation;
pub mod worker;
pub mod workspace;

pub use agent::{Agent, AgentRegistry, AgentRunResult, StreamHooks};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, RunSummary};
pub use events::{Event, EventBus, EventPayload};
pub use tracker::{MemoryTracker, Task, TaskStatus, Tracker};
