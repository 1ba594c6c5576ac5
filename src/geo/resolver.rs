use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use super::cache::GeoCache;
use super::providers::{lookup_many, GeoProvider};
use crate::types::GeoRecord;

/// Divisor applied to the last IPv4 octet when picking a primary provider.
pub const BUCKET_DIVISOR: u32 = 6;

/// Primary provider bucket of an IP: last octet mod 6, with remainders 0-2 → 0, 3 → 1,
/// 4-5 → 2 (about 50% / 17% / 33%). A last component that is not a number goes to bucket 0.
pub fn primary_bucket(ip: &str) -> usize {
    let octet = ip
        .rsplit('.')
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    match octet % BUCKET_DIVISOR {
        0..=2 => 0,
        3 => 1,
        _ => 2,
    }
}

/// Fans lookups for unknown IPs across the configured providers and caches what it learns.
pub struct GeoResolver {
    providers: Vec<Arc<dyn GeoProvider>>,
    cache: Arc<GeoCache>,
    workers: usize,
}

impl GeoResolver {
    pub fn new(providers: Vec<Arc<dyn GeoProvider>>, cache: Arc<GeoCache>, workers: usize) -> Self {
        Self {
            providers,
            cache,
            workers: workers.max(1),
        }
    }

    /// Index of the provider handling `ip` first.
    pub fn primary_index(&self, ip: &str) -> usize {
        primary_bucket(ip) % self.providers.len().max(1)
    }

    /// Resolve every IP in `ips`. Every input IP is present in the result; unresolved ones map
    /// to the empty record.
    pub async fn resolve(&self, ips: &[String]) -> HashMap<String, GeoRecord> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = ips.iter().filter(|ip| seen.insert(ip.as_str())).cloned().collect();

        let (mut out, misses) = self.cache.partition(&unique).await;
        if misses.is_empty() || self.providers.is_empty() {
            for ip in misses {
                out.insert(ip, GeoRecord::default());
            }
            return out;
        }

        // First pass: each miss goes to its primary provider only; all providers run at once.
        let mut routes: Vec<Vec<String>> = vec![Vec::new(); self.providers.len()];
        for ip in &misses {
            routes[self.primary_index(ip)].push(ip.clone());
        }
        let first = self.run_all(routes).await;

        let mut merged: HashMap<String, GeoRecord> = HashMap::with_capacity(misses.len());
        for ip in &misses {
            let primary = self.primary_index(ip);
            let mut record = first[primary].get(ip).cloned().unwrap_or_default();
            // Only finds anything if routes overlap; today each miss has one route.
            for (idx, results) in first.iter().enumerate() {
                if idx == primary {
                    continue;
                }
                if let Some(other) = results.get(ip) {
                    record = record.merge(other);
                }
            }
            merged.insert(ip.clone(), record);
        }

        // Enrichment: records still lacking country or org ask every non-primary provider.
        let mut enrich: Vec<Vec<String>> = vec![Vec::new(); self.providers.len()];
        for ip in &misses {
            if !merged[ip].is_incomplete() {
                continue;
            }
            let primary = self.primary_index(ip);
            for (idx, list) in enrich.iter_mut().enumerate() {
                if idx != primary {
                    list.push(ip.clone());
                }
            }
        }
        let enrich_count: usize = enrich.iter().map(Vec::len).sum();
        if enrich_count > 0 {
            let second = self.run_all(enrich).await;
            for results in &second {
                for (ip, extra) in results {
                    if let Some(record) = merged.get_mut(ip) {
                        *record = record.merge(extra);
                    }
                }
            }
        }

        let mut cached = 0usize;
        for (ip, record) in merged {
            if self.cache.insert(&ip, record.clone()).await {
                cached += 1;
            }
            out.insert(ip, record);
        }
        info!(
            requested = unique.len(),
            looked_up = misses.len(),
            enrichment_queries = enrich_count,
            cached,
            "geo batch resolved"
        );
        out
    }

    async fn run_all(&self, routes: Vec<Vec<String>>) -> Vec<HashMap<String, GeoRecord>> {
        let lookups = self.providers.iter().zip(routes).map(|(provider, ips)| {
            let provider = provider.clone();
            let workers = self.workers;
            async move {
                if ips.is_empty() {
                    return HashMap::new();
                }
                debug!(provider = provider.name(), count = ips.len(), "geo lookups dispatched");
                lookup_many(provider, ips, workers).await
            }
        });
        join_all(lookups).await
    }
}
