// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{ServerError, ServerResult};

/// Runtime configuration, parsed from the command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "staccato")]
#[command(about = "Static file server on an epoll reactor and a bounded worker pool")]
#[command(version)]
pub struct Config {
    /// TCP port to listen on
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Directory files are served from
    #[arg(long, default_value = "./resources")]
    pub root: PathBuf,

    /// Document served for `/`
    #[arg(long, default_value = "index.html")]
    pub index: String,

    /// Worker threads
    #[arg(long, default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Maximum connections waiting for a worker
    #[arg(long, default_value_t = 10_000)]
    pub max_requests: usize,

    /// Maximum simultaneous connections; extra ones are closed on accept
    #[arg(long, default_value_t = 65_535)]
    pub max_connections: usize,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub idle_timeout: u64,

    /// Pin worker threads to CPU cores
    #[arg(long)]
    pub pin_workers: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            host: "0.0.0.0".to_string(),
            root: PathBuf::from("./resources"),
            index: "index.html".to_string(),
            workers: num_cpus::get(),
            max_requests: 10_000,
            max_connections: 65_535,
            idle_timeout: 0,
            pin_workers: false,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.workers == 0 {
            return Err(ServerError::Config("--workers must be >= 1".to_string()));
        }
        if self.max_requests == 0 {
            return Err(ServerError::Config("--max-requests must be >= 1".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("--max-connections must be >= 1".to_string()));
        }
        if self.index.is_empty() || self.index.contains('/') {
            return Err(ServerError::Config(format!(
                "--index must be a plain file name, got {:?}",
                self.index
            )));
        }
        if !self.root.is_dir() {
            return Err(ServerError::Config(format!(
                "document root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}
