use std::{collections::HashMap, net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::{AppConfig, RegionConfig},
    error::ApiError,
    geo::GeoResolver,
    prober::TcpProber,
    scanner::Scanner,
    serverlist::EndpointSource,
    types::{GeoRecord, RegionReport},
};

pub const MAX_GEO_IPS: usize = 100;
pub const DEFAULT_PING_PORT: u16 = 4000;
pub const PING_ATTEMPTS_RANGE: (u32, u32) = (1, 5);
pub const DEFAULT_PING_ATTEMPTS: u32 = 3;
pub const PING_TIMEOUT_RANGE_MS: (u64, u64) = (500, 10_000);
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 2500;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<ServerState>, // immutable after startup; the resolver cache locks internally
}

struct ServerState {
    regions: Vec<RegionConfig>,
    prober: TcpProber,
    scanner: Arc<Scanner>,
    resolver: Arc<GeoResolver>,
    source: Arc<dyn EndpointSource>,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        prober: TcpProber,
        scanner: Arc<Scanner>,
        resolver: Arc<GeoResolver>,
        source: Arc<dyn EndpointSource>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerState {
                regions: config.regions.clone(),
                prober,
                scanner,
                resolver,
                source,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GeoResponse {
    pub results: HashMap<String, GeoRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingParams {
    pub ip: String,
    pub port: u16,
    pub attempts: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub ping: Option<u32>,
    pub samples: Vec<f64>,
    pub source: &'static str,
    pub attempts: u32,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
}

pub fn router(state: AppState) -> Router {
    let ping = Router::new()
        .route("/ping", post(post_ping))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let api = Router::new()
        .route("/geo", post(post_geo))
        .route("/regions", get(get_regions))
        .route("/scan/{region}", get(get_scan))
        .merge(ping)
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Strict dotted-quad IPv4 (four decimal octets 0-255).
pub fn is_dotted_quad(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// Validate a geo request: `ips` must be a list of 1..=100 entries. Entries that are not
/// dotted quads are dropped rather than rejected.
pub fn parse_geo_request(body: &Value) -> Result<Vec<String>, ApiError> {
    let ips = body
        .get("ips")
        .ok_or_else(|| ApiError::BadRequest("missing field: ips".into()))?
        .as_array()
        .ok_or_else(|| ApiError::BadRequest("ips must be a list".into()))?;
    if ips.is_empty() {
        return Err(ApiError::BadRequest("ips must not be empty".into()));
    }
    if ips.len() > MAX_GEO_IPS {
        return Err(ApiError::BadRequest(format!("at most {MAX_GEO_IPS} ips per request")));
    }
    Ok(ips
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| is_dotted_quad(s))
        .map(String::from)
        .collect())
}

/// Validate a ping request. `port` must be an integer in 1..=65535; `attempts` and
/// `timeoutMs` are clamped into range.
pub fn parse_ping_request(body: &Value) -> Result<PingParams, ApiError> {
    let ip = body
        .get("ip")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| is_dotted_quad(s))
        .ok_or_else(|| ApiError::BadRequest("ip must be a dotted-quad IPv4 address".into()))?;

    let port = match body.get("port") {
        None | Some(Value::Null) => DEFAULT_PING_PORT,
        Some(v) => v
            .as_u64()
            .filter(|p| (1..=u16::MAX as u64).contains(p))
            .map(|p| p as u16)
            .ok_or_else(|| ApiError::BadRequest("port must be an integer in 1-65535".into()))?,
    };

    let (min_attempts, max_attempts) = PING_ATTEMPTS_RANGE;
    let attempts = body
        .get("attempts")
        .and_then(Value::as_f64)
        .map(|n| n.round().clamp(min_attempts as f64, max_attempts as f64) as u32)
        .unwrap_or(DEFAULT_PING_ATTEMPTS);

    let (min_timeout, max_timeout) = PING_TIMEOUT_RANGE_MS;
    let timeout_ms = body
        .get("timeoutMs")
        .and_then(Value::as_f64)
        .map(|n| n.round().clamp(min_timeout as f64, max_timeout as f64) as u64)
        .unwrap_or(DEFAULT_PING_TIMEOUT_MS);

    Ok(PingParams {
        ip: ip.to_string(),
        port,
        attempts,
        timeout_ms,
    })
}

fn json_body(body: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e.body_text())))
}

async fn post_geo(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<GeoResponse>, ApiError> {
    let ips = parse_geo_request(&json_body(body)?)?;
    let resolved = app.inner.resolver.resolve(&ips).await;
    let results = ips
        .into_iter()
        .map(|ip| {
            let record = resolved.get(&ip).cloned().unwrap_or_default();
            (ip, record)
        })
        .collect();
    Ok(Json(GeoResponse { results }))
}

async fn post_ping(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<PingResponse>, ApiError> {
    let params = parse_ping_request(&json_body(body)?)?;
    let prober = app
        .inner
        .prober
        .with_limits(params.attempts, Duration::from_millis(params.timeout_ms));
    let report = prober.measure_samples(&params.ip, params.port).await;
    Ok(Json(PingResponse {
        ping: report.ping,
        samples: report.samples.iter().map(|ms| (ms * 100.0).round() / 100.0).collect(),
        source: "server",
        attempts: params.attempts,
        timeout_ms: params.timeout_ms,
    }))
}

async fn get_regions(State(app): State<AppState>) -> Json<Vec<RegionConfig>> {
    Json(app.inner.regions.clone())
}

async fn get_scan(
    State(app): State<AppState>,
    Path(region): Path<String>,
) -> Result<Json<RegionReport>, ApiError> {
    let region = app
        .inner
        .regions
        .iter()
        .find(|r| r.id.eq_ignore_ascii_case(&region))
        .ok_or_else(|| ApiError::NotFound(format!("unknown region: {region}")))?;
    let report = app
        .inner
        .scanner
        .scan_region_from(region, app.inner.source.as_ref())
        .await;
    Ok(Json(report))
}
