//! # ktl-stack
//!
//! The stack orchestrator behind `ktl`: a DAG-driven, multi-cluster Helm
//! release scheduler that plans, executes, resumes, and audits
//! deployments under concurrency and failure constraints.
//!
//! ## Features
//!
//! - **Deterministic planning** — Release declarations resolve against
//!   clusters and profiles into an immutable, topologically ordered plan;
//!   cycles and dangling dependencies fail at compile time.
//! - **Effective-input hashing** — Every input feeding a release (chart
//!   content, values files, set overrides, cluster binding, apply/delete
//!   options, git identity) is digested into a single hash that gates
//!   resume and powers drift detection.
//! - **Bounded, policy-aware scheduling** — Topological waves run under a
//!   global concurrency cap and named parallelism buckets, with
//!   critical-first tie-breaking, fail-fast or continue-on-error, and
//!   rate-limit-aware retries with backoff and a bounded retry budget.
//! - **Observable execution** — A totally ordered, monotonically
//!   sequenced event stream is appended to a durable JSONL log before any
//!   observer sees it; consoles and mirrors subscribe as observers.
//! - **Resumable runs** — Plan, statuses, and events persist under
//!   `<stack_root>/.ktl/stack/runs/<run_id>/`; interrupted runs resume
//!   from the first unfinished node, refusing silently drifted inputs.
//! - **Audit trail** — A run summary receipt records per-node attempts,
//!   durations, and classified errors alongside the git identity the
//!   stack was deployed from.
//!
//! ## Pipeline
//!
//! Each node runs **render → diff → upgrade/install → wait → post-hooks
//! → verify**; delete collapses to a single destroy phase. Phase
//! outcomes thread through a tagged [`pipeline::Outcome`], never panics.
//!
//! ## Modules
//!
//! - [`plan`] — Stack declarations, profile overlays, plan compilation
//! - [`inputs`] — Effective-input projection and hashing
//! - [`engine`] — The scheduler: admission, retries, failure propagation
//! - [`pipeline`] — Per-node deploy pipeline and stack diff summaries
//! - [`tracker`] — Live resource readiness tracking
//! - [`verify`] — Post-apply condition and warning-event verification
//! - [`store`] — Durable run directory: plan, status, events, summary
//! - [`bus`] — Sequenced event bus with durable-first delivery
//! - [`hooks`] — kubectl/script hook execution
//! - [`helm`] / [`kube`] — Collaborator contracts the embedder implements
//! - [`git`] — Stack git identity
//! - [`types`] — Domain types shared across the crate
//!
//! The CLI adapter lives in the `ktl-stack-cli` crate; the manifest
//! differ in `ktl-manifest`; backoff policies in `ktl-retry`.

/// Sequenced event bus with durable-first delivery.
pub mod bus;

/// The scheduler: admission, retries, failure propagation.
pub mod engine;

/// Stack git identity (commit + dirty flag).
pub mod git;

/// Semantic contract of the Helm-equivalent driver.
pub mod helm;

/// kubectl/script hook execution.
pub mod hooks;

/// Effective-input projection and hashing.
pub mod inputs;

/// Read-side Kubernetes contract the embedder implements.
pub mod kube;

/// Stack-level run lock.
pub mod lock;

/// Per-node deploy pipeline and stack diff summaries.
pub mod pipeline;

/// Stack declarations, profile overlays, plan compilation.
pub mod plan;

/// Explicit runtime context: clock, drivers, reporter, cancellation.
pub mod runtime;

/// Durable run directory: plan, status, events, summary.
pub mod store;

/// Live resource readiness tracking.
pub mod tracker;

/// Domain types shared across the crate.
pub mod types;

/// Post-apply condition and warning-event verification.
pub mod verify;

mod process;

pub use engine::{RunReport, run};
pub use runtime::{CancelToken, Clock, Reporter, RuntimeContext};
pub use types::{RunCommand, RunOptions, RunStatus};
