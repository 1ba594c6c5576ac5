use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::trace;

use crate::types::GeoRecord;

/// In-memory IP → geo record cache.
///
/// Created once at startup and shared by handle; entries live until the process exits (no
/// eviction, no TTL). Records without any information are refused so that failed lookups are
/// retried on the next request.
#[derive(Debug, Default)]
pub struct GeoCache {
    memory: RwLock<HashMap<String, GeoRecord>>,
}

impl GeoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, ip: &str) -> Option<GeoRecord> {
        let guard = self.memory.read().await;
        guard.get(ip).cloned()
    }

    /// Split `ips` into cached hits and misses, in input order for misses.
    pub async fn partition(&self, ips: &[String]) -> (HashMap<String, GeoRecord>, Vec<String>) {
        let guard = self.memory.read().await;
        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        for ip in ips {
            match guard.get(ip) {
                Some(record) => {
                    hits.insert(ip.clone(), record.clone());
                }
                None => misses.push(ip.clone()),
            }
        }
        (hits, misses)
    }

    /// Insert `record` if it carries information. Returns whether it was stored.
    pub async fn insert(&self, ip: &str, record: GeoRecord) -> bool {
        if !record.has_info() {
            return false;
        }
        let mut guard = self.memory.write().await;
        guard.insert(ip.to_string(), record);
        trace!(ip, "geo record cached");
        true
    }

    pub async fn len(&self) -> usize {
        self.memory.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
