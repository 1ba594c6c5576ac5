mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{providers, FakeProvider};
use region_ping_rs::geo::{
    geo_channel, lookup_many, primary_bucket, spawn_geo_batcher, GeoCache, GeoProvider, GeoResolver,
};
use region_ping_rs::types::GeoRecord;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn ips(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn bucket_is_pure_function_of_last_octet() {
    assert_eq!(primary_bucket("9.9.9.9"), primary_bucket("1.2.3.9"));
    assert_eq!(primary_bucket("9.9.9.9"), 1);
    assert_eq!(primary_bucket("8.8.8.8"), 0);
    assert_eq!(primary_bucket("1.1.1.4"), 2);
}

#[tokio::test]
async fn secondary_provider_fills_missing_primary_result() {
    // 9.9.9.9 routes to provider 1, which knows nothing about it.
    let (fakes, dyns) = providers(
        FakeProvider::new("p0").with("9.9.9.9", GeoRecord::new("JP", "Japan", "")),
        FakeProvider::new("p1"),
        FakeProvider::new("p2"),
    );
    let cache = Arc::new(GeoCache::new());
    let resolver = GeoResolver::new(dyns, cache.clone(), 8);

    let out = resolver.resolve(&ips(&["9.9.9.9"])).await;

    assert_eq!(out["9.9.9.9"].country_code, "JP");
    assert_eq!(fakes[1].seen(), vec!["9.9.9.9"]);
    assert_eq!(fakes[0].seen(), vec!["9.9.9.9"]);
    assert_eq!(fakes[2].seen(), vec!["9.9.9.9"]);
    assert_eq!(cache.get("9.9.9.9").await.unwrap().country_code, "JP");
}

#[tokio::test]
async fn enrichment_merges_on_top_of_primary() {
    let (fakes, dyns) = providers(
        FakeProvider::new("p0").with("10.0.0.6", GeoRecord::new("US", "", "Primary Org")),
        FakeProvider::new("p1").with("10.0.0.6", GeoRecord::new("", "", "Other Org")),
        FakeProvider::new("p2").with("10.0.0.6", GeoRecord::new("US", "United States", "")),
    );
    let resolver = GeoResolver::new(dyns, Arc::new(GeoCache::new()), 8);

    let out = resolver.resolve(&ips(&["10.0.0.6"])).await;

    // Later providers' non-empty fields win, empty ones never erase.
    assert_eq!(out["10.0.0.6"], GeoRecord::new("US", "United States", "Other Org"));
    assert_eq!(fakes[0].call_count(), 1);
}

#[tokio::test]
async fn complete_primary_result_skips_enrichment() {
    let (fakes, dyns) = providers(
        FakeProvider::new("p0").with("10.0.0.12", GeoRecord::new("DE", "Germany", "Hetzner")),
        FakeProvider::new("p1"),
        FakeProvider::new("p2"),
    );
    let resolver = GeoResolver::new(dyns, Arc::new(GeoCache::new()), 8);

    let out = resolver.resolve(&ips(&["10.0.0.12"])).await;

    assert_eq!(out["10.0.0.12"], GeoRecord::new("DE", "Germany", "Hetzner"));
    assert_eq!(fakes[1].call_count(), 0);
    assert_eq!(fakes[2].call_count(), 0);
}

#[tokio::test]
async fn cached_ips_do_not_hit_providers_again() {
    let (fakes, dyns) = providers(
        FakeProvider::new("p0").with("10.0.0.0", GeoRecord::new("FR", "France", "OVH")),
        FakeProvider::new("p1"),
        FakeProvider::new("p2"),
    );
    let resolver = GeoResolver::new(dyns, Arc::new(GeoCache::new()), 8);

    let first = resolver.resolve(&ips(&["10.0.0.0"])).await;
    let second = resolver.resolve(&ips(&["10.0.0.0"])).await;

    assert_eq!(first, second);
    assert_eq!(fakes[0].call_count(), 1);
}

#[tokio::test]
async fn empty_results_are_retried_later() {
    let (fakes, dyns) = providers(FakeProvider::new("p0"), FakeProvider::new("p1"), FakeProvider::new("p2"));
    let cache = Arc::new(GeoCache::new());
    let resolver = GeoResolver::new(dyns, cache.clone(), 8);

    let out = resolver.resolve(&ips(&["10.0.0.1"])).await;
    assert_eq!(out["10.0.0.1"], GeoRecord::default());
    assert!(cache.is_empty().await);

    resolver.resolve(&ips(&["10.0.0.1"])).await;
    assert_eq!(fakes[0].call_count(), 2);
}

#[tokio::test]
async fn every_requested_ip_is_answered_once() {
    let (fakes, dyns) = providers(FakeProvider::new("p0"), FakeProvider::new("p1"), FakeProvider::new("p2"));
    let resolver = GeoResolver::new(dyns, Arc::new(GeoCache::new()), 8);
    let input = ips(&["10.0.0.1", "10.0.0.3", "10.0.0.4", "10.0.0.1"]);

    let out = resolver.resolve(&input).await;

    assert_eq!(out.len(), 3);
    // Primary routing: .1 → p0, .3 → p1, .4 → p2; the rest are enrichment queries.
    assert_eq!(fakes[0].seen().iter().filter(|ip| *ip == "10.0.0.1").count(), 1);
    assert_eq!(fakes[1].seen().iter().filter(|ip| *ip == "10.0.0.3").count(), 1);
    assert_eq!(fakes[2].seen().iter().filter(|ip| *ip == "10.0.0.4").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn providers_run_concurrently() {
    let delay = Duration::from_millis(100);
    let (_fakes, dyns) = providers(
        FakeProvider::new("p0").with_delay(delay).with("10.0.0.0", GeoRecord::new("A", "A", "A")),
        FakeProvider::new("p1").with_delay(delay).with("10.0.0.3", GeoRecord::new("B", "B", "B")),
        FakeProvider::new("p2").with_delay(delay).with("10.0.0.4", GeoRecord::new("C", "C", "C")),
    );
    let resolver = GeoResolver::new(dyns, Arc::new(GeoCache::new()), 8);

    let start = Instant::now();
    resolver.resolve(&ips(&["10.0.0.0", "10.0.0.3", "10.0.0.4"])).await;
    assert!(start.elapsed() < Duration::from_millis(150));
}

#[tokio::test]
async fn batcher_resolves_queued_ips() {
    let (_fakes, dyns) = providers(
        FakeProvider::new("p0").with("10.0.0.2", GeoRecord::new("SG", "Singapore", "Example")),
        FakeProvider::new("p1"),
        FakeProvider::new("p2"),
    );
    let cache = Arc::new(GeoCache::new());
    let resolver = Arc::new(GeoResolver::new(dyns, cache.clone(), 8));
    let (notifier, rx) = geo_channel(16);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let handle = spawn_geo_batcher(resolver, rx, Duration::from_millis(20), 100, Some(out_tx));

    notifier.notify("10.0.0.2");
    notifier.notify("10.0.0.5");
    notifier.notify("10.0.0.2");
    drop(notifier);

    let mut resolved = std::collections::HashMap::new();
    while let Some(batch) = out_rx.recv().await {
        resolved.extend(batch);
    }
    handle.await.unwrap();

    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved["10.0.0.2"].country_code, "SG");
    assert!(cache.get("10.0.0.2").await.is_some());
    assert!(cache.get("10.0.0.5").await.is_none());
}

#[tokio::test]
async fn batch_provider_is_queried_in_chunks() {
    let provider = Arc::new(
        FakeProvider::new("batch")
            .batched()
            .with("10.1.0.7", GeoRecord::new("JP", "Japan", "NTT")),
    );
    let input: Vec<String> = (0..150).map(|i| format!("10.1.{}.{}", i / 100, i % 100)).collect();

    let out = lookup_many(provider.clone() as Arc<dyn GeoProvider>, input, 8).await;

    assert_eq!(provider.batch_sizes(), vec![100, 50]);
    // Partial answer: IPs the provider skipped are simply absent.
    assert_eq!(out.len(), 1);
    assert_eq!(out["10.1.0.7"].country, "Japan");
}

#[tokio::test]
async fn batch_gaps_are_filled_by_enrichment() {
    // Both IPs route to the batch provider; it only knows the first.
    let (fakes, dyns) = providers(
        FakeProvider::new("p0")
            .batched()
            .with("10.0.0.0", GeoRecord::new("FR", "France", "OVH")),
        FakeProvider::new("p1").with("10.0.0.1", GeoRecord::new("DE", "", "Hetzner")),
        FakeProvider::new("p2").with("10.0.0.1", GeoRecord::new("DE", "Germany", "")),
    );
    let resolver = GeoResolver::new(dyns, Arc::new(GeoCache::new()), 8);

    let out = resolver.resolve(&ips(&["10.0.0.0", "10.0.0.1"])).await;

    assert_eq!(fakes[0].batch_sizes(), vec![2]);
    assert_eq!(out["10.0.0.0"], GeoRecord::new("FR", "France", "OVH"));
    assert_eq!(out["10.0.0.1"], GeoRecord::new("DE", "Germany", "Hetzner"));
    assert_eq!(fakes[1].seen(), vec!["10.0.0.1"]);
    assert_eq!(fakes[2].seen(), vec!["10.0.0.1"]);
}
