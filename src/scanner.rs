use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{GeoSettings, RegionConfig, ScanSettings};
use crate::geo::{geo_channel, spawn_geo_batcher, GeoBatch, GeoNotifier, GeoResolver};
use crate::prober::Probe;
use crate::serverlist::EndpointSource;
use crate::types::{ActiveGroup, Endpoint, GroupTag, ProbeOutcome, RegionReport, RegionResult};

/// Live success/timeout counters of one group, readable by the sibling group while being written.
#[derive(Debug, Default)]
pub struct GroupCounters {
    success: AtomicU64,
    timeout: AtomicU64,
}

impl GroupCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Acquire)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout.load(Ordering::Acquire)
    }

    fn record(&self, ping: Option<u32>) {
        let counter = if ping.is_some() { &self.success } else { &self.timeout };
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// Snapshot of a finished group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupStats {
    pub success_count: u64,
    pub timeout_count: u64,
    pub outcomes: Vec<(usize, ProbeOutcome)>,
}

/// When a group may stop probing: it has seen `timeout_threshold` timeouts and its sibling
/// already has `sibling_success_min` successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyStop {
    pub timeout_threshold: u64,
    pub sibling_success_min: u64,
}

impl EarlyStop {
    pub fn should_stop(&self, own: &GroupCounters, sibling: &GroupCounters) -> bool {
        own.timeout_count() >= self.timeout_threshold
            && sibling.success_count() >= self.sibling_success_min
    }
}

/// Progress event for each outcome transition of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeUpdate {
    pub region: String,
    pub sequence_index: usize,
    pub outcome: ProbeOutcome,
}

/// Drives the probing of regions.
///
/// - Within a group, endpoints are probed strictly in list order.
/// - The two groups of a region run concurrently and see each other's live counters.
/// - Reachable IPs are handed to the geo queue without waiting on it.
pub struct Scanner {
    prober: Arc<dyn Probe>,
    settings: ScanSettings,
    geo: Option<GeoNotifier>,
    updates: Option<mpsc::UnboundedSender<ProbeUpdate>>,
}

impl Scanner {
    pub fn new(prober: Arc<dyn Probe>, settings: ScanSettings) -> Self {
        Self {
            prober,
            settings,
            geo: None,
            updates: None,
        }
    }

    pub fn with_geo(mut self, geo: GeoNotifier) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<ProbeUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Probe one group in order, updating `own` as it goes.
    ///
    /// With `sibling` and `early` set, the remaining endpoints are marked skipped as soon as the
    /// early-stop condition holds before a probe.
    pub async fn probe_group(
        &self,
        region: &str,
        endpoints: &[Endpoint],
        own: &GroupCounters,
        sibling: Option<&GroupCounters>,
        early: Option<EarlyStop>,
    ) -> GroupStats {
        let mut outcomes: Vec<(usize, ProbeOutcome)> = endpoints
            .iter()
            .map(|e| (e.sequence_index, ProbeOutcome::default()))
            .collect();

        for (idx, endpoint) in endpoints.iter().enumerate() {
            if let (Some(sibling), Some(early)) = (sibling, early) {
                if early.should_stop(own, sibling) {
                    debug!(
                        region,
                        skipped = endpoints.len() - idx,
                        timeouts = own.timeout_count(),
                        "group stopped early"
                    );
                    for (seq, outcome) in outcomes[idx..].iter_mut() {
                        if outcome.skip() {
                            self.publish(region, *seq, *outcome);
                        }
                    }
                    break;
                }
            }

            let (seq, outcome) = &mut outcomes[idx];
            if outcome.start_measuring() {
                self.publish(region, *seq, *outcome);
            }

            let ping = self.prober.measure(&endpoint.ip, endpoint.port).await;
            if outcome.finish(ping) {
                own.record(ping);
                self.publish(region, *seq, *outcome);
            }

            if ping.is_some() {
                if let Some(geo) = &self.geo {
                    geo.notify(&endpoint.ip);
                }
            }
        }

        GroupStats {
            success_count: own.success_count(),
            timeout_count: own.timeout_count(),
            outcomes,
        }
    }

    /// Scan one region and resolve its active group.
    pub async fn scan_region(&self, region: &RegionConfig, endpoints: &[Endpoint]) -> RegionResult {
        if !region.has_groups {
            let counters = GroupCounters::new();
            let stats = self.probe_group(&region.id, endpoints, &counters, None, None).await;
            let result = RegionResult {
                active_group: ActiveGroup::from_success_counts(stats.success_count, 0),
                outcomes: stats.outcomes.into_iter().collect(),
            };
            log_summary(&region.id, &result);
            return result;
        }

        let (group_a, group_b): (Vec<Endpoint>, Vec<Endpoint>) = endpoints
            .iter()
            .cloned()
            .partition(|e| e.effective_group() == GroupTag::A);

        let early = EarlyStop {
            timeout_threshold: self.settings.threshold_for(region),
            sibling_success_min: self.settings.sibling_success_min,
        };
        let counters_a = GroupCounters::new();
        let counters_b = GroupCounters::new();

        let (stats_a, stats_b) = tokio::join!(
            self.probe_group(&region.id, &group_a, &counters_a, Some(&counters_b), Some(early)),
            self.probe_group(&region.id, &group_b, &counters_b, Some(&counters_a), Some(early)),
        );

        let result = RegionResult {
            active_group: ActiveGroup::from_success_counts(stats_a.success_count, stats_b.success_count),
            outcomes: stats_a.outcomes.into_iter().chain(stats_b.outcomes).collect(),
        };
        log_summary(&region.id, &result);
        result
    }

    /// Fetch and scan several regions concurrently. A failed list fetch only marks that region.
    pub async fn scan_regions(
        &self,
        regions: &[RegionConfig],
        source: &dyn EndpointSource,
    ) -> Vec<RegionReport> {
        join_all(regions.iter().map(|region| self.scan_region_from(region, source))).await
    }

    pub async fn scan_region_from(
        &self,
        region: &RegionConfig,
        source: &dyn EndpointSource,
    ) -> RegionReport {
        match source.fetch_endpoints(&region.id).await {
            Ok(endpoints) => {
                let result = self.scan_region(region, &endpoints).await;
                RegionReport {
                    region: region.id.clone(),
                    scanned_at: now_rfc3339(),
                    endpoints,
                    result: Some(result),
                    error: None,
                }
            }
            Err(e) => {
                warn!(region = %region.id, error = %e, "server list fetch failed");
                RegionReport {
                    region: region.id.clone(),
                    scanned_at: now_rfc3339(),
                    endpoints: Vec::new(),
                    result: None,
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }

    /// Scan `regions` while a batcher resolves reachable IPs as they are found.
    ///
    /// Returns once the geo queue has drained, with every record the batches produced. An IP
    /// the full queue dropped is resolved once at the end, so no reachable IP reaches the
    /// providers twice in one run.
    pub async fn scan_with_geo(
        self,
        regions: &[RegionConfig],
        source: &dyn EndpointSource,
        resolver: Arc<GeoResolver>,
        batching: &GeoSettings,
    ) -> (Vec<RegionReport>, GeoBatch) {
        let (notifier, rx) = geo_channel(batching.queue_capacity);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let batcher = spawn_geo_batcher(
            resolver.clone(),
            rx,
            Duration::from_millis(batching.batch_window_ms),
            batching.max_batch,
            Some(out_tx),
        );

        let scanner = self.with_geo(notifier);
        let reports = scanner.scan_regions(regions, source).await;
        // Closing the queue lets the batcher flush its last batch and exit.
        drop(scanner);

        let mut resolved = GeoBatch::new();
        while let Some(batch) = out_rx.recv().await {
            resolved.extend(batch);
        }
        if let Err(e) = batcher.await {
            warn!(error = %e, "geo batcher failed");
        }

        let dropped: Vec<String> = reachable_ips(&reports)
            .into_iter()
            .filter(|ip| !resolved.contains_key(ip))
            .collect();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "resolving IPs the geo queue dropped");
            resolved.extend(resolver.resolve(&dropped).await);
        }
        (reports, resolved)
    }

    fn publish(&self, region: &str, sequence_index: usize, outcome: ProbeOutcome) {
        if let Some(tx) = &self.updates {
            // Receiver gone means nobody is watching progress anymore.
            let _ = tx.send(ProbeUpdate {
                region: region.to_string(),
                sequence_index,
                outcome,
            });
        }
    }
}

/// Distinct IPs with a measured ping, in report order.
pub fn reachable_ips(reports: &[RegionReport]) -> Vec<String> {
    let mut ips = Vec::new();
    for report in reports {
        let Some(result) = &report.result else { continue };
        for endpoint in &report.endpoints {
            let reachable = result
                .outcomes
                .get(&endpoint.sequence_index)
                .is_some_and(|o| o.ping.is_some());
            if reachable && !ips.contains(&endpoint.ip) {
                ips.push(endpoint.ip.clone());
            }
        }
    }
    ips
}

fn log_summary(region: &str, result: &RegionResult) {
    let reachable = result.outcomes.values().filter(|o| o.ping.is_some()).count();
    info!(
        region,
        active_group = result.active_group.map(ActiveGroup::as_str).unwrap_or("none"),
        reachable,
        total = result.outcomes.len(),
        "region scanned"
    );
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
