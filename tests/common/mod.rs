//! Deterministic fakes for the prober, geo providers and server list.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use region_ping_rs::config::RegionConfig;
use region_ping_rs::geo::GeoProvider;
use region_ping_rs::prober::Probe;
use region_ping_rs::serverlist::EndpointSource;
use region_ping_rs::types::{Endpoint, GeoRecord, GroupTag};

/// Answers from a fixed table; unknown IPs time out. Optional per-IP delay.
#[derive(Default)]
pub struct FakeProber {
    pings: HashMap<String, Option<u32>>,
    delays: HashMap<String, Duration>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, ip: &str, ping: Option<u32>) -> Self {
        self.pings.insert(ip.to_string(), ping);
        self
    }

    pub fn delay(mut self, ip: &str, delay: Duration) -> Self {
        self.delays.insert(ip.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Probe for FakeProber {
    async fn measure(&self, ip: &str, _port: u16) -> Option<u32> {
        self.calls.lock().unwrap().push(ip.to_string());
        if let Some(d) = self.delays.get(ip) {
            tokio::time::sleep(*d).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.pings.get(ip).copied().flatten()
    }
}

/// Geo provider answering from a fixed table and recording every single lookup.
///
/// With `batched()`, lookups arrive as multi-IP requests and only known IPs are answered.
pub struct FakeProvider {
    name: &'static str,
    records: HashMap<String, GeoRecord>,
    delay: Option<Duration>,
    batch: bool,
    pub seen: Mutex<Vec<String>>,
    pub batches: Mutex<Vec<Vec<String>>>,
}

impl FakeProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: HashMap::new(),
            delay: None,
            batch: false,
            seen: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batched(mut self) -> Self {
        self.batch = true;
        self
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn with(mut self, ip: &str, record: GeoRecord) -> Self {
        self.records.insert(ip.to_string(), record);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl GeoProvider for FakeProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn lookup_one(&self, ip: &str) -> GeoRecord {
        self.seen.lock().unwrap().push(ip.to_string());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.records.get(ip).cloned().unwrap_or_default()
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn lookup_batch(&self, ips: &[String]) -> HashMap<String, GeoRecord> {
        self.batches.lock().unwrap().push(ips.to_vec());
        self.seen.lock().unwrap().extend(ips.iter().cloned());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        ips.iter()
            .filter_map(|ip| self.records.get(ip).map(|r| (ip.clone(), r.clone())))
            .collect()
    }
}

/// Three fake providers in bucket order, plus the same handles as trait objects.
pub fn providers(
    p0: FakeProvider,
    p1: FakeProvider,
    p2: FakeProvider,
) -> (Vec<Arc<FakeProvider>>, Vec<Arc<dyn GeoProvider>>) {
    let fakes = vec![Arc::new(p0), Arc::new(p1), Arc::new(p2)];
    let dyns = fakes
        .iter()
        .map(|p| p.clone() as Arc<dyn GeoProvider>)
        .collect();
    (fakes, dyns)
}

/// In-memory server lists; regions not present fail to fetch.
#[derive(Default)]
pub struct FakeSource {
    lists: HashMap<String, Vec<Endpoint>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, id: &str, endpoints: Vec<Endpoint>) -> Self {
        self.lists.insert(id.to_string(), endpoints);
        self
    }
}

#[async_trait]
impl EndpointSource for FakeSource {
    async fn fetch_endpoints(&self, region: &str) -> Result<Vec<Endpoint>> {
        match self.lists.get(region) {
            Some(eps) => Ok(eps.clone()),
            None => bail!("no server list for region {region}"),
        }
    }
}

pub fn endpoint(seq: usize, ip: &str, group: Option<GroupTag>) -> Endpoint {
    Endpoint {
        id: format!("srv{seq}"),
        ip: ip.to_string(),
        port: 4001,
        group,
        sequence_index: seq,
    }
}

pub fn region(id: &str, has_groups: bool, asia: bool) -> RegionConfig {
    RegionConfig {
        id: id.to_string(),
        name: id.to_uppercase(),
        has_groups,
        asia,
    }
}
