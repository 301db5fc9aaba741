//! CI execution backends for quantum-merge.
//!
//! Provides executor implementations the scheduler drives:
//! - Shell command (runs the project's CI entry point locally)

pub mod shell;

pub use quantum_core::Executor;
pub use shell::ShellExecutor;
