//! Server configuration.
//!
//! One JSON document per site, passed to `tollgated` on the command line.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bon::Builder;
use serde::Deserialize;
use url::Url;

use crate::error::Result;

fn default_network() -> String {
    "bitcoin".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address the HTTP listener binds to.
    pub listen: SocketAddr,
    /// Public hostname used in payment URLs and memos.
    pub domain: String,
    /// Root directory holding the site's stores and published files.
    pub site_dir: PathBuf,
    /// Network label reported in payment requests.
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub env: RunEnv,
    /// Partition id for this worker's counters file and derivation paths.
    /// Every worker sharing one site directory must use a distinct id.
    #[serde(default)]
    pub worker_id: u32,
    /// Relay endpoints for transaction broadcast, tried in order.
    pub relays: Vec<RelayEndpoint>,
    #[serde(default)]
    pub policy: Policy,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnv {
    Dev,
    #[default]
    Production,
}

/// A third-party service accepting raw transactions for broadcast.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEndpoint {
    pub name: String,
    pub url: Url,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// Timing policy. Every window is per-deployment configuration; the defaults
/// match the behavior the protocol was designed around.
#[derive(Builder, Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    /// How long an unpaid invoice is handed back to repeat requests for the
    /// same path instead of minting new outputs.
    #[builder(default = 300)]
    pub reuse_window_secs: u64,
    /// How long after creation an invoice can be fetched and paid.
    #[builder(default = 900)]
    pub payment_window_secs: u64,
    /// How long a paid invoice grants access to its path.
    #[builder(default = 21_600)]
    pub access_window_secs: u64,
    /// Idle time before a cached session handle is dropped.
    #[builder(default = 3_600)]
    pub evict_idle_secs: u64,
    /// Idle time before a session's backing store is deleted outright.
    #[builder(default = 28_800)]
    pub purge_idle_secs: u64,
    #[builder(default = 60)]
    pub reconcile_interval_secs: u64,
    #[builder(default = 30)]
    pub reload_interval_secs: u64,
    #[builder(default = 600)]
    pub evict_interval_secs: u64,
    /// Invoices copied per reconciliation batch.
    #[builder(default = 100)]
    pub reconcile_batch: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::builder().build()
    }
}

impl Policy {
    pub fn reuse_window_ms(&self) -> i64 {
        self.reuse_window_secs as i64 * 1000
    }

    pub fn payment_window_ms(&self) -> i64 {
        self.payment_window_secs as i64 * 1000
    }

    pub fn access_window_ms(&self) -> i64 {
        self.access_window_secs as i64 * 1000
    }

    pub fn evict_idle_ms(&self) -> i64 {
        self.evict_idle_secs as i64 * 1000
    }

    pub fn purge_idle_ms(&self) -> i64 {
        self.purge_idle_secs as i64 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "listen": "127.0.0.1:8098",
                "domain": "example.test",
                "siteDir": "/var/sites/example",
                "relays": [{ "name": "main", "url": "https://relay.example/tx" }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.env, RunEnv::Production);
        assert_eq!(config.worker_id, 0);
        assert_eq!(config.network, "bitcoin");
        assert_eq!(config.policy.reuse_window_secs, 300);
        assert_eq!(config.policy.access_window_secs, 21_600);
        assert!(config.relays[0].extra_headers.is_empty());
    }

    #[test]
    fn policy_windows_are_configurable() {
        let config: Config = serde_json::from_str(
            r#"{
                "listen": "127.0.0.1:8098",
                "domain": "example.test",
                "siteDir": "/var/sites/example",
                "env": "dev",
                "relays": [],
                "policy": { "reuseWindowSecs": 10, "purgeIdleSecs": 60 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.env, RunEnv::Dev);
        assert_eq!(config.policy.reuse_window_ms(), 10_000);
        assert_eq!(config.policy.purge_idle_ms(), 60_000);
        // Untouched fields keep their defaults.
        assert_eq!(config.policy.payment_window_secs, 900);
    }
}
