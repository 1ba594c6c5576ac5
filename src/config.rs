use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from a JSON file. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub geo: GeoSettings,
    /// URL template of the per-region server list; `{region}` is substituted.
    #[serde(default = "default_server_list_url")]
    pub server_list_url: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_regions")]
    pub regions: Vec<RegionConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            probe: ProbeSettings::default(),
            scan: ScanSettings::default(),
            geo: GeoSettings::default(),
            server_list_url: default_server_list_url(),
            bind: default_bind(),
            regions: default_regions(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn region(&self, id: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.id.eq_ignore_ascii_case(id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_gap_ms")]
    pub gap_ms: u64,
    #[serde(default = "default_min_valid_ms")]
    pub min_valid_ms: f64,
    #[serde(default = "default_max_valid_ms")]
    pub max_valid_ms: f64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            timeout_ms: default_probe_timeout_ms(),
            gap_ms: default_gap_ms(),
            min_valid_ms: default_min_valid_ms(),
            max_valid_ms: default_max_valid_ms(),
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn gap(&self) -> Duration {
        Duration::from_millis(self.gap_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_asia_threshold")]
    pub asia_timeout_threshold: u64,
    #[serde(default = "default_timeout_threshold")]
    pub default_timeout_threshold: u64,
    /// Successes the sibling group needs before this group may stop early.
    #[serde(default = "default_sibling_success_min")]
    pub sibling_success_min: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            asia_timeout_threshold: default_asia_threshold(),
            default_timeout_threshold: default_timeout_threshold(),
            sibling_success_min: default_sibling_success_min(),
        }
    }
}

impl ScanSettings {
    pub fn threshold_for(&self, region: &RegionConfig) -> u64 {
        if region.asia {
            self.asia_timeout_threshold
        } else {
            self.default_timeout_threshold
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoSettings {
    /// Concurrent lookups per provider.
    #[serde(default = "default_geo_workers")]
    pub workers: usize,
    #[serde(default = "default_geo_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_ip_api_url")]
    pub ip_api_url: String,
    #[serde(default = "default_ipwhois_url")]
    pub ipwhois_url: String,
    #[serde(default = "default_ipinfo_url")]
    pub ipinfo_url: String,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            workers: default_geo_workers(),
            request_timeout_ms: default_geo_request_timeout_ms(),
            batch_window_ms: default_batch_window_ms(),
            max_batch: default_max_batch(),
            queue_capacity: default_queue_capacity(),
            ip_api_url: default_ip_api_url(),
            ipwhois_url: default_ipwhois_url(),
            ipinfo_url: default_ipinfo_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub has_groups: bool,
    #[serde(default)]
    pub asia: bool,
}

fn default_attempts() -> u32 { 3 }
fn default_probe_timeout_ms() -> u64 { 2500 }
fn default_gap_ms() -> u64 { 30 }
fn default_min_valid_ms() -> f64 { 1.0 }
fn default_max_valid_ms() -> f64 { 4000.0 }
fn default_asia_threshold() -> u64 { 3 }
fn default_timeout_threshold() -> u64 { 5 }
fn default_sibling_success_min() -> u64 { 3 }
fn default_geo_workers() -> usize { 8 }
fn default_geo_request_timeout_ms() -> u64 { 5000 }
fn default_batch_window_ms() -> u64 { 250 }
fn default_max_batch() -> usize { 100 }
fn default_queue_capacity() -> usize { 1024 }
fn default_ip_api_url() -> String { "http://ip-api.com".into() }
fn default_ipwhois_url() -> String { "https://ipwho.is".into() }
fn default_ipinfo_url() -> String { "https://ipinfo.io".into() }
fn default_server_list_url() -> String { "http://127.0.0.1:8000/lists/{region}.txt".into() }
fn default_bind() -> String { "127.0.0.1:8080".into() }

fn default_regions() -> Vec<RegionConfig> {
    const BUILTIN: &[(&str, &str, bool, bool)] = &[
        ("jp", "Japan", true, true),
        ("hk", "Hong Kong", true, true),
        ("sg", "Singapore", true, true),
        ("eu", "Europe", true, false),
        ("us", "North America", true, false),
        ("sa", "South America", false, false),
        ("oc", "Oceania", false, false),
    ];
    BUILTIN
        .iter()
        .map(|&(id, name, has_groups, asia)| RegionConfig {
            id: id.into(),
            name: name.into(),
            has_groups,
            asia,
        })
        .collect()
}
