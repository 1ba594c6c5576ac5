//! IP geolocation: provider adapters, the multi-provider resolver, its cache and the batching
//! queue that feeds it from the scanner.
pub mod batcher;
pub mod cache;
pub mod providers;
pub mod resolver;

pub use batcher::{geo_channel, spawn_geo_batcher, GeoBatch, GeoNotifier};
pub use cache::GeoCache;
pub use providers::{default_providers, lookup_many, GeoProvider};
pub use resolver::{primary_bucket, GeoResolver};
