//! Ledgergate - resilient access to a multi-endpoint ledger-query service.
//!
//! Remote ledger-query providers are rate-limited, occasionally
//! unavailable, and independently flaky. This crate routes opaque remote
//! operations across a pool of endpoints, tracking per-endpoint health,
//! respecting per-scope rate limits, and retrying throttled or transient
//! failures with backoff until each caller's future settles exactly once.
//!
//! # Architecture
//!
//! - [`endpoint`] - endpoint identity, health state, and the registry
//! - [`health`] - periodic canary probing that flips endpoint health
//! - [`pool`] - load-balancing connection handles over healthy endpoints
//! - [`limiter`] - sliding-window rate limiting with per-scope backoff
//! - [`scheduler`] - priority retry queue draining under a concurrency cap
//! - [`gateway`] - the owned object wiring it all, with `start`/`stop`
//!
//! Supporting modules: [`config`] (TOML configuration), [`error`] (the
//! failure taxonomy), [`event`] (typed notifications).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ledgergate::config::{Config, EndpointConfig};
//! use ledgergate::endpoint::EndpointProbe;
//! use ledgergate::gateway::Gateway;
//! use ledgergate::Result;
//!
//! struct PingProbe;
//!
//! #[async_trait::async_trait]
//! impl EndpointProbe for PingProbe {
//!     async fn check(&self, _url: &url::Url) -> Result<()> {
//!         // Issue a cheap canary call against the endpoint here.
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let mut config = Config::default();
//! config.endpoints.push(EndpointConfig {
//!     url: url::Url::parse("https://rpc-a.example.com").unwrap(),
//!     priority: 0,
//! });
//!
//! let gateway = Gateway::new(config, Arc::new(PingProbe))?;
//! gateway.start().await;
//!
//! let height = gateway
//!     .submit("block-height", 1, 3, || async {
//!         Ok::<_, ledgergate::Error>(42u64)
//!     })
//!     .await?;
//! println!("height: {height}");
//!
//! gateway.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod gateway;
pub mod health;
pub mod limiter;
pub mod pool;
pub mod scheduler;

#[cfg(feature = "testkit")]
pub mod testkit;

pub use error::{Error, Result};
pub use gateway::Gateway;
