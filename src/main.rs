use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use region_ping_rs::config::{AppConfig, RegionConfig};
use region_ping_rs::geo::{default_providers, geo_channel, spawn_geo_batcher, GeoCache, GeoResolver};
use region_ping_rs::prober::TcpProber;
use region_ping_rs::scanner::Scanner;
use region_ping_rs::server::{self, AppState};
use region_ping_rs::serverlist::HttpServerList;
use region_ping_rs::types::{GeoRecord, ProbeStatus, RegionReport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// region-ping-rs: per-region game server latency scanner with active-group detection and IP geolocation.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "region-ping-rs",
    version,
    about = "Per-region game server latency scanner with active-group detection and IP geolocation.",
    long_about = None
)]
struct Cli {
    /// Path to a JSON config file. Built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address for the HTTP API (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Start the HTTP API and keep running until Ctrl+C.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Region id to scan; repeatable. Scans every configured region when omitted (unless serving).
    #[arg(long = "region")]
    regions: Vec<String>,

    /// Write scan reports as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Skip geolocation of reachable endpoints.
    #[arg(long = "no-geo", default_value_t = false)]
    no_geo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match cli.config.as_deref() {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(bind) = cli.bind.clone() {
        config.bind = bind;
    }

    info!(
        regions = config.regions.len(),
        attempts = config.probe.attempts,
        timeout_ms = config.probe.timeout_ms,
        geo_workers = config.geo.workers,
        server_list = %config.server_list_url,
        "configuration loaded"
    );

    let cache = Arc::new(GeoCache::new());
    let resolver = Arc::new(GeoResolver::new(
        default_providers(&config.geo)?,
        cache,
        config.geo.workers,
    ));
    let prober = TcpProber::new(&config.probe);
    let source = Arc::new(HttpServerList::new(
        &config.server_list_url,
        Duration::from_millis(config.geo.request_timeout_ms),
    )?);

    let shutdown = CancellationToken::new();
    let server_task = if cli.serve {
        // On-demand API scans warm the geo cache through their own batcher.
        let mut api_scanner = Scanner::new(Arc::new(prober.clone()), config.scan.clone());
        if !cli.no_geo {
            let (notifier, rx) = geo_channel(config.geo.queue_capacity);
            spawn_geo_batcher(
                resolver.clone(),
                rx,
                Duration::from_millis(config.geo.batch_window_ms),
                config.geo.max_batch,
                None,
            );
            api_scanner = api_scanner.with_geo(notifier);
        }
        let state = AppState::new(
            &config,
            prober.clone(),
            Arc::new(api_scanner),
            resolver.clone(),
            source.clone(),
        );
        let bind = config.bind.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state, token).await {
                error!(error = %e, "HTTP API server error");
            }
        }))
    } else {
        None
    };

    if !cli.serve || !cli.regions.is_empty() {
        let regions = select_regions(&config, &cli.regions)?;
        let scanner = Scanner::new(Arc::new(prober.clone()), config.scan.clone());
        let (reports, geo) = if cli.no_geo {
            (scanner.scan_regions(&regions, source.as_ref()).await, HashMap::new())
        } else {
            scanner
                .scan_with_geo(&regions, source.as_ref(), resolver.clone(), &config.geo)
                .await
        };
        for report in &reports {
            print_report(report, &geo);
        }
        if let Some(path) = cli.output.as_deref() {
            match write_reports_json(path, &reports) {
                Ok(()) => info!(path = %path.display(), "wrote JSON reports"),
                Err(e) => error!(path = %path.display(), error = %e, "failed to write JSON reports"),
            }
        }
    }

    if let Some(task) = server_task {
        info!("press Ctrl+C to stop the server");
        let _ = tokio::signal::ctrl_c().await;
        shutdown.cancel();
        let _ = task.await;
    }

    Ok(())
}

fn select_regions(config: &AppConfig, ids: &[String]) -> Result<Vec<RegionConfig>> {
    if ids.is_empty() {
        return Ok(config.regions.clone());
    }
    ids.iter()
        .map(|id| {
            config
                .region(id)
                .cloned()
                .with_context(|| format!("unknown region: {id}"))
        })
        .collect()
}

fn print_report(report: &RegionReport, geo: &HashMap<String, GeoRecord>) {
    let Some(result) = &report.result else {
        println!(
            "\nRegion {}: server list unavailable ({})",
            report.region,
            report.error.as_deref().unwrap_or("unknown error")
        );
        return;
    };

    let active = result.active_group.map(|g| g.as_str()).unwrap_or("none");
    println!("\nRegion {} (active group: {})", report.region, active);

    let mut ip_w = "ip".len();
    let mut org_w = "org".len();
    for e in &report.endpoints {
        ip_w = ip_w.max(e.ip.len());
        if let Some(g) = geo.get(&e.ip) {
            org_w = org_w.max(g.org.len().min(40));
        }
    }

    println!(
        "{:<ip_w$}  {:>5}  {:<5}  {:<9}  {:>7}  {:<7}  {:<org_w$}",
        "ip", "port", "group", "status", "ping_ms", "country", "org",
    );
    println!(
        "{:-<ip_w$}  {:-<5}  {:-<5}  {:-<9}  {:-<7}  {:-<7}  {:-<org_w$}",
        "", "", "", "", "", "", "",
    );
    for e in &report.endpoints {
        let outcome = result.outcomes.get(&e.sequence_index).copied().unwrap_or_default();
        let status = match outcome.status {
            ProbeStatus::Waiting => "waiting",
            ProbeStatus::Measuring => "measuring",
            ProbeStatus::Done => "done",
            ProbeStatus::Timeout => "timeout",
            ProbeStatus::Skipped => "skipped",
        };
        let group = e.group.map(|g| format!("{g:?}")).unwrap_or_else(|| "-".into());
        let ping = outcome.ping.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let record = geo.get(&e.ip).cloned().unwrap_or_default();
        let mut org = record.org;
        if org.len() > 40 {
            org = org.chars().take(40).collect();
        }
        println!(
            "{:<ip_w$}  {:>5}  {:<5}  {:<9}  {:>7}  {:<7}  {:<org_w$}",
            e.ip, e.port, group, status, ping, record.country_code, org,
        );
    }
}

fn write_reports_json(path: &std::path::Path, reports: &[RegionReport]) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, reports)?;
    Ok(())
}
