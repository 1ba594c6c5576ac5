use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::types::{Endpoint, GroupTag};

/// Game server ports that belong to a match cluster.
pub const GAME_PORTS: std::ops::RangeInclusive<u16> = 4000..=4999;

/// Where a region's endpoint list comes from.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn fetch_endpoints(&self, region: &str) -> Result<Vec<Endpoint>>;
}

/// Parse a plaintext server list into endpoints.
///
/// Format per line: `ID TYPE IP PORT VAL1 VAL2 NUM1 NUM2 [GROUP]`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
/// - lines with fewer than 8 fields, a non-IPv4 address or a port outside 4000-4999 are dropped
/// - `GROUP` is only read when the line has at least 9 fields
pub fn parse_server_list(s: &str) -> Vec<Endpoint> {
    let mut out = Vec::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            debug!(line_no, "server list line has too few fields");
            continue;
        }

        let Ok(ip) = fields[2].parse::<Ipv4Addr>() else {
            debug!(line_no, ip = fields[2], "server list line has invalid ip");
            continue;
        };
        let port = match parse_game_port(fields[3]) {
            Ok(p) => p,
            Err(e) => {
                debug!(line_no, error = %e, "server list line has invalid port");
                continue;
            }
        };
        let group = fields.get(8).and_then(|g| GroupTag::parse(g));

        out.push(Endpoint {
            id: fields[0].to_string(),
            ip: ip.to_string(),
            port,
            group,
            sequence_index: out.len(),
        });
    }

    out
}

fn parse_game_port(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val > u16::MAX as u32 || !GAME_PORTS.contains(&(val as u16)) {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

/// Fetches `<template with {region} substituted>` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpServerList {
    client: reqwest::Client,
    url_template: String,
}

impl HttpServerList {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build server list HTTP client")?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn url_for(&self, region: &str) -> String {
        self.url_template.replace("{region}", region)
    }
}

#[async_trait]
impl EndpointSource for HttpServerList {
    async fn fetch_endpoints(&self, region: &str) -> Result<Vec<Endpoint>> {
        let url = self.url_for(region);
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to fetch server list: {url}"))?
            .text()
            .await
            .with_context(|| format!("failed to read server list body: {url}"))?;
        let endpoints = parse_server_list(&body);
        debug!(region, count = endpoints.len(), "server list fetched");
        Ok(endpoints)
    }
}
