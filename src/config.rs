//! Process configuration.

use std::time::Duration;

/// Identity the probes use when opening sessions against the backends.
/// Prepended to each backend DSN, so the DSN itself may override any of it.
pub const DEFAULT_PROBE_CREDENTIALS: &str =
    "user=postgres dbname=postgres password=password sslmode=disable";

pub struct ProxyConfig {
    /// Address to accept client connections on.
    pub listen: String,
    /// Backend DSNs; the set is fixed for the process lifetime.
    pub backends: Vec<String>,
    /// Delay between two health probes of the same backend.
    pub probe_interval: Duration,
    /// Keyword/value pairs prepended to a backend DSN when probing it.
    pub probe_credentials: String,
}

impl ProxyConfig {
    /// Full DSN the probe connects with for the given backend.
    pub fn probe_dsn(&self, backend: &str) -> String {
        format!("{} {}", self.probe_credentials, backend)
    }
}
