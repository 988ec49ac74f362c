//! Environment configuration for the sync backend.
//!
//! The backend is configured out-of-band through environment variables.
//! Absent or placeholder values are treated as "no backend configured":
//! consumers degrade to the in-memory store (no data, no error) so the
//! application remains usable in local and offline development.
//!
//! Recognized keys:
//! - `SHOAL_SERVER_URL` — WebSocket URL of the sync server (client side)
//! - `SHOAL_BIND_ADDR`  — listen address for the sync server
//! - `SHOAL_DATA_DIR`   — snapshot persistence directory for the server

/// WebSocket URL of the sync server, e.g. `ws://127.0.0.1:9620`.
pub const ENV_SERVER_URL: &str = "SHOAL_SERVER_URL";
/// Listen address for the sync server, e.g. `127.0.0.1:9620`.
pub const ENV_BIND_ADDR: &str = "SHOAL_BIND_ADDR";
/// Snapshot persistence directory for the sync server.
pub const ENV_DATA_DIR: &str = "SHOAL_DATA_DIR";

/// Placeholder fragments that mark a value as "not really configured".
///
/// Scaffolding tools and example env files ship values like
/// `ws://your-server-url` — connecting to those would only produce
/// confusing errors, so they count as absent.
const PLACEHOLDER_FRAGMENTS: &[&str] = &["your-", "changeme", "example.com"];

/// Client-side sync configuration resolved from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfig {
    /// Server URL, present only when genuinely configured.
    pub server_url: Option<String>,
}

impl SyncConfig {
    /// Resolve configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup (for testing).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let server_url = lookup(ENV_SERVER_URL).and_then(|value| {
            if is_placeholder(&value) {
                log::info!("{ENV_SERVER_URL} is unset or a placeholder; staying offline");
                None
            } else {
                Some(value.trim().to_string())
            }
        });
        Self { server_url }
    }

    /// Whether a real backend is configured.
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some()
    }
}

/// Check whether a configuration value is empty or an obvious placeholder.
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_lowercase();
    PLACEHOLDER_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}
