// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("staccato is built on epoll and only supports Linux");

pub mod config;
pub mod connection;
pub mod error;
pub mod files;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod poller;
pub mod pool;
pub mod response;
pub mod server;
pub mod slab;
pub mod sync;

// Re-exports for users
pub use config::Config;
pub use error::{ServerError, ServerResult};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use pool::{PoolOptions, WorkerPool};
pub use server::{Server, ShutdownHandle};
