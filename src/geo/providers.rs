use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::GeoSettings;
use crate::types::GeoRecord;

/// Upper bound of queries ip-api accepts in one batch request.
pub const IP_API_BATCH_LIMIT: usize = 100;

/// One upstream geolocation source.
///
/// Lookups never fail: transport errors, non-success statuses and provider-side failure
/// responses all normalize to the empty record.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup_one(&self, ip: &str) -> GeoRecord;

    fn supports_batch(&self) -> bool {
        false
    }

    /// Single multi-IP request. Returns a partial map keyed by queried IP; a network failure
    /// yields an empty map.
    async fn lookup_batch(&self, _ips: &[String]) -> HashMap<String, GeoRecord> {
        HashMap::new()
    }
}

/// Look up every IP through `provider`.
///
/// Batch-capable providers get one request per chunk of [`IP_API_BATCH_LIMIT`]. Otherwise
/// `workers` tasks pull from a shared atomic cursor into `ips` until it is exhausted.
pub async fn lookup_many(
    provider: Arc<dyn GeoProvider>,
    ips: Vec<String>,
    workers: usize,
) -> HashMap<String, GeoRecord> {
    if ips.is_empty() {
        return HashMap::new();
    }

    if provider.supports_batch() {
        let mut out = HashMap::with_capacity(ips.len());
        for chunk in ips.chunks(IP_API_BATCH_LIMIT) {
            out.extend(provider.lookup_batch(chunk).await);
        }
        return out;
    }

    let ips: Arc<[String]> = ips.into();
    let cursor = Arc::new(AtomicUsize::new(0));
    let mut set = JoinSet::new();

    for _ in 0..workers.clamp(1, ips.len()) {
        let provider = provider.clone();
        let ips = ips.clone();
        let cursor = cursor.clone();
        set.spawn(async move {
            let mut found = Vec::new();
            loop {
                let idx = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(ip) = ips.get(idx) else { break };
                let record = provider.lookup_one(ip).await;
                found.push((ip.clone(), record));
            }
            found
        });
    }

    let mut out = HashMap::with_capacity(ips.len());
    while let Some(res) = set.join_next().await {
        match res {
            Ok(found) => out.extend(found),
            Err(e) => warn!(provider = provider.name(), error = %e, "geo worker failed"),
        }
    }
    out
}

/// The three default providers, in bucket order.
pub fn default_providers(settings: &GeoSettings) -> Result<Vec<Arc<dyn GeoProvider>>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(settings.request_timeout_ms))
        .build()
        .context("failed to build geo HTTP client")?;
    Ok(vec![
        Arc::new(IpApi::new(client.clone(), &settings.ip_api_url)),
        Arc::new(IpWhoIs::new(client.clone(), &settings.ipwhois_url)),
        Arc::new(IpInfo::new(client, &settings.ipinfo_url)),
    ])
}

async fn fetch_json(provider: &'static str, request: reqwest::RequestBuilder) -> Option<Value> {
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            debug!(provider, error = %e, "geo request failed");
            return None;
        }
    };
    if !response.status().is_success() {
        warn!(provider, status = %response.status(), "geo provider returned error status");
        return None;
    }
    match response.json::<Value>().await {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(provider, error = %e, "geo response was not JSON");
            None
        }
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

fn first_non_empty<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a.trim().is_empty() {
        b
    } else {
        a
    }
}

/// ip-api.com: `status == "success"`, `countryCode`, `country`, `org` (falls back to `isp`).
#[derive(Debug, Clone)]
pub struct IpApi {
    client: reqwest::Client,
    base_url: String,
}

impl IpApi {
    const FIELDS: &'static str = "status,message,countryCode,country,org,isp,query";

    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

pub fn normalize_ip_api(v: &Value) -> GeoRecord {
    if str_field(v, "status") != "success" {
        return GeoRecord::default();
    }
    GeoRecord::new(
        str_field(v, "countryCode"),
        str_field(v, "country"),
        first_non_empty(str_field(v, "org"), str_field(v, "isp")),
    )
}

#[async_trait]
impl GeoProvider for IpApi {
    fn name(&self) -> &'static str {
        "ip-api"
    }

    async fn lookup_one(&self, ip: &str) -> GeoRecord {
        let url = format!("{}/json/{}", self.base_url, ip);
        let req = self.client.get(url).query(&[("fields", Self::FIELDS)]);
        fetch_json(self.name(), req)
            .await
            .map(|v| normalize_ip_api(&v))
            .unwrap_or_default()
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn lookup_batch(&self, ips: &[String]) -> HashMap<String, GeoRecord> {
        let url = format!("{}/batch", self.base_url);
        let body: Vec<Value> = ips.iter().map(|ip| json!({ "query": ip })).collect();
        let req = self
            .client
            .post(url)
            .query(&[("fields", Self::FIELDS)])
            .json(&body);
        let Some(Value::Array(items)) = fetch_json(self.name(), req).await else {
            return HashMap::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let query = str_field(item, "query");
                (!query.is_empty()).then(|| (query.to_string(), normalize_ip_api(item)))
            })
            .collect()
    }
}

/// ipwho.is: `success == true`, `country_code`, `country`, `connection.org` (falls back to `connection.isp`).
#[derive(Debug, Clone)]
pub struct IpWhoIs {
    client: reqwest::Client,
    base_url: String,
}

impl IpWhoIs {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

pub fn normalize_ipwhois(v: &Value) -> GeoRecord {
    if v.get("success").and_then(Value::as_bool) != Some(true) {
        return GeoRecord::default();
    }
    let connection = v.get("connection").unwrap_or(&Value::Null);
    GeoRecord::new(
        str_field(v, "country_code"),
        str_field(v, "country"),
        first_non_empty(str_field(connection, "org"), str_field(connection, "isp")),
    )
}

#[async_trait]
impl GeoProvider for IpWhoIs {
    fn name(&self) -> &'static str {
        "ipwho.is"
    }

    async fn lookup_one(&self, ip: &str) -> GeoRecord {
        let url = format!("{}/{}", self.base_url, ip);
        fetch_json(self.name(), self.client.get(url))
            .await
            .map(|v| normalize_ipwhois(&v))
            .unwrap_or_default()
    }
}

/// ipinfo.io: `country` is the alpha-2 code and there is no display name; `org` carries an
/// `AS<number> ` prefix. `bogon` or `error` responses are failures.
#[derive(Debug, Clone)]
pub struct IpInfo {
    client: reqwest::Client,
    base_url: String,
}

impl IpInfo {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

pub fn normalize_ipinfo(v: &Value) -> GeoRecord {
    if v.get("bogon").and_then(Value::as_bool) == Some(true) || v.get("error").is_some() {
        return GeoRecord::default();
    }
    GeoRecord::new(str_field(v, "country"), "", strip_asn(str_field(v, "org")))
}

fn strip_asn(org: &str) -> &str {
    match org.split_once(' ') {
        Some((asn, rest)) if is_asn(asn) => rest.trim_start(),
        _ => org,
    }
}

fn is_asn(s: &str) -> bool {
    let digits = s.strip_prefix("AS").or_else(|| s.strip_prefix("as"));
    matches!(digits, Some(d) if !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
}

#[async_trait]
impl GeoProvider for IpInfo {
    fn name(&self) -> &'static str {
        "ipinfo"
    }

    async fn lookup_one(&self, ip: &str) -> GeoRecord {
        let url = format!("{}/{}/json", self.base_url, ip);
        fetch_json(self.name(), self.client.get(url))
            .await
            .map(|v| normalize_ipinfo(&v))
            .unwrap_or_default()
    }
}
