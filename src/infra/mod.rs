//! Infrastructure - configuration and link statistics
//!
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free link counters
//! - `shutdown` - SIGINT/SIGTERM to a `watch` shutdown flag

pub mod config;
pub mod metrics;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, ReconnectPolicy};
pub use metrics::{LinkStats, LinkSummary};
pub use shutdown::install_shutdown_handler;
