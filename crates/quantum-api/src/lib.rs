//! HTTP API for quantum-merge.
//!
//! Exposes job submission and the read-only job listing as JSON.

pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use server::serve;
pub use state::AppState;
