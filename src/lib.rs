//! Library crate for region-ping-rs: per-region game server latency scanning with active-group
//! detection, and multi-provider IP geolocation for the endpoints that answer.
pub mod config;
pub mod error;
pub mod geo;
pub mod prober;
pub mod scanner;
pub mod server;
pub mod serverlist;
pub mod types;
