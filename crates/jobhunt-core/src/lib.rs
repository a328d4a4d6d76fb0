//! jobhunt-core - coordination core for an automated job-application
//! pipeline.
//!
//! Several independent workers apply to postings from one shared markdown
//! backlog. This crate keeps them from stepping on each other and from
//! leaving the pipeline wedged after a crash.
//!
//! # Modules
//!
//! - [`backlog`]: parse, mutate and atomically rewrite the backlog, its
//!   dedup index, the application tracker and the archive
//! - [`lane_lock`]: one exclusive lock per ATS lane, with orphan and TTL
//!   healing
//! - [`claim`]: per-posting claims so two workers never apply to the same
//!   URL
//! - [`reconcile`]: the periodic pass that ends abandoned worker runs,
//!   enforces session guardrails and heals locks and claims
//! - [`dispatch`]: per-lane readiness snapshot for a scheduler
//!
//! # Architecture
//!
//! ```text
//!            scheduler                         workers
//!                |                                |
//!                v                                v
//!   dispatch_snapshot ──reads──> backlog <──mutators── mark-applied / skip
//!                |                                |
//!                +──checks──> lane locks <──acquire/release
//!                |                                |
//!                +──filters─> claims   <──claim/release
//!                                  ^
//!                                  |
//!                         reconcile (periodic)
//! ```
//!
//! All shared state lives in files under one workspace directory
//! ([`layout::WorkspaceLayout`]). Every write is an atomic rename and every
//! read-modify-write runs under an advisory `flock`.

pub mod backlog;
pub mod claim;
pub mod config;
pub mod dispatch;
pub mod fsio;
pub mod lane_lock;
pub mod layout;
pub mod reconcile;

pub use backlog::{BacklogError, BacklogStore};
pub use claim::{ClaimError, ClaimRegistry};
pub use config::JobhuntConfig;
pub use dispatch::{DispatchSnapshot, dispatch_snapshot};
pub use lane_lock::{LaneLockError, LaneLockManager, LivenessOracle};
pub use layout::WorkspaceLayout;
pub use reconcile::{ReconcileError, ReconcileReceipt, Reconciler};
