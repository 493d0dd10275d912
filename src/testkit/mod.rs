//! Test fixtures for exercising the connection layer without a network.
//!
//! Only compiled with the `testkit` feature, which the crate's own tests
//! enable through the self-dev-dependency.

pub mod probe;

/// Configuration constructors for tests.
pub mod config {
    use url::Url;

    use crate::config::{Config, EndpointConfig};

    /// Endpoint configs for the given URLs, all priority 0.
    pub fn endpoints(urls: &[&str]) -> Vec<EndpointConfig> {
        urls.iter()
            .map(|u| EndpointConfig {
                url: Url::parse(u).expect("test URL must parse"),
                priority: 0,
            })
            .collect()
    }

    /// A default configuration over the given endpoints.
    pub fn with_endpoints(urls: &[&str]) -> Config {
        Config {
            endpoints: endpoints(urls),
            ..Default::default()
        }
    }
}
