//! podkeeper - kubectl port-forward supervisor
//!
//! Keeps local tunnels to Kubernetes pods alive, re-establishing each one
//! whenever its pod dies, is rescheduled, or the cluster becomes
//! unreachable for a while.
//!
//! # Features
//!
//! - Pod lists merged from a user-global and a project-local JSON file
//! - Short-name and prefix resolution of configured pods
//! - Periodic reconciliation against `kubectl get pods`
//! - Bounded reconnection with a per-session retry timer
//! - Classification of `kubectl port-forward` output into session events
//! - Structured logging with tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use podkeeper::{Kubectl, PodSpec, RunConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RunConfig::default();
//!     let specs = vec![PodSpec::parse("web:8080")?, PodSpec::parse("db:5432:5432")?];
//!
//!     let mut supervisor = Supervisor::new(
//!         config.clone(),
//!         Kubectl::new(config.clone()),
//!         Kubectl::new(config),
//!         specs,
//!     );
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
//!     let exit = supervisor.run(shutdown_rx).await?;
//!     std::process::exit(exit.exit_code());
//! }
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod health;
pub mod kubectl;
pub mod matcher;
pub mod session;
pub mod supervisor;

pub use config::{PodRegistry, PortEntry, RunConfig};
pub use error::{PodkeeperError, PodkeeperResult};
pub use forwarding::PodSpec;
pub use health::RetryPolicy;
pub use kubectl::Kubectl;
pub use supervisor::{Exit, ShutdownSignal, Supervisor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with tracing; `verbosity` raises the default level
pub fn init_logging(verbosity: u8) -> PodkeeperResult<()> {
    let default_filter = match verbosity {
        0 => "podkeeper=info",
        1 => "podkeeper=debug",
        _ => "podkeeper=trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        )
        .try_init()
        .map_err(|e| PodkeeperError::Config(e.to_string()))?;

    Ok(())
}
