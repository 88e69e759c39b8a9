//! Durable metadata store for the task queue engine.
//!
//! Wraps PostgreSQL access behind typed row structs ([`models`]), a pool
//! and migration runner ([`pool`]), environment-driven configuration
//! ([`config`]), and the query functions the rest of the engine calls
//! ([`queries`]).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use models::{Priority, Task, TaskStatus};
