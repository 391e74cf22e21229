#![recursion_limit = "256"]

pub mod checkpoint;
pub mod clips;
pub mod clustering;
pub mod config;
pub mod data;
pub mod embedding;
pub mod error;
pub mod export;
pub mod model;
pub mod pipeline;
pub mod plotting;
pub mod projection;
pub mod sampling;

pub use error::{AnalysisError, Result};

/// Install the fmt subscriber used by the binaries. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
