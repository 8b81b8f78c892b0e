//! HTTP gateway for the dispatch engine.
//!
//! The external timer hits `POST /api/v1/dispatch/run` with the shared
//! secret; the remaining routes expose job management and the delivery
//! ledger.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
