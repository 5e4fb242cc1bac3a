//! Infrastructure Layer
//!
//! Cross-cutting concerns shared by the node's tasks.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
