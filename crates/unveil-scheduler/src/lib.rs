//! # Unveil Scheduler
//!
//! Turns scheduled announcement jobs into per-guest deliveries.
//!
//! ```text
//! timer ──► DispatchEngine::run_batch
//!              │
//!              ├─ reconcile   re-claim jobs stuck in Sending
//!              ├─ selector    CAS-claim due jobs (Scheduled → Sending)
//!              └─ per job ─┬─ resolver      audience → recipients
//!                          ├─ materialize   one message per job
//!                          ├─ dispatch      push, SMS fallback, ledger
//!                          └─ aggregate     Sent / Failed + counts
//! ```
//!
//! All durable state lives in [`SchedulerDb`] (SQLite).

pub mod aggregate;
pub mod dispatch;
pub mod engine;
pub mod materialize;
pub mod persistence;
pub mod reconcile;
pub mod resolver;
pub mod selector;

pub use dispatch::Dispatcher;
pub use engine::{DispatchEngine, ImmediateSend};
pub use persistence::SchedulerDb;
pub use resolver::RecipientResolver;
