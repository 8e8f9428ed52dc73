use std::time::Duration;

use clap::Args;
use kvx_core::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Connection settings for a Consul agent.
///
/// Embeddable in a binary's CLI with `#[command(flatten)]`, or deserialized
/// from the opaque options handed to the backend registry.
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Consul HTTP API address
    #[arg(
        long = "consul-address",
        default_value = "http://127.0.0.1:8500",
        env = "CONSUL_HTTP_ADDR"
    )]
    pub address: String,

    /// ACL token sent with every request
    #[arg(long = "consul-token", env = "CONSUL_HTTP_TOKEN")]
    pub token: Option<String>,

    /// Datacenter to query (agent's own datacenter when unset)
    #[arg(long = "consul-datacenter", env = "CONSUL_DATACENTER")]
    pub datacenter: Option<String>,

    /// Maximum duration of a blocking query (seconds)
    #[arg(long = "consul-wait", default_value = "60", env = "CONSUL_WAIT")]
    pub wait_secs: u64,

    /// Attempts made to obtain a session before giving up
    #[arg(
        long = "session-retry-attempts",
        default_value = "5",
        env = "KVX_SESSION_RETRY_ATTEMPTS"
    )]
    pub retry_attempts: u32,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            wait_secs: 60,
            retry_attempts: 5,
        }
    }
}

impl ConsulConfig {
    /// Config for the agent at `address`, everything else default.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Base URL of the HTTP API. `CONSUL_HTTP_ADDR` is commonly set without
    /// a scheme, in which case plain HTTP is assumed.
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }

    /// Maximum wait of a blocking query.
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// Retry policy for session creation and renewal.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.retry_attempts)
    }
}
