//! dragnet - central analytics for a fleet of WarDragon field sensor kits.
//!
//! Ingests drone/aircraft tracks, RF signal detections, and kit health
//! telemetry over per-kit HTTP polling and an MQTT bus, persists them in
//! time-partitioned TimescaleDB relations, and serves a read API with
//! pattern detection and RSSI-based geolocation.

pub mod actions;
pub mod bus;
pub mod collector;
pub mod config;
pub mod db;
pub mod estimator;
pub mod geo;
pub mod health_repo;
pub mod kit_client;
pub mod kit_health;
pub mod kits;
pub mod kits_repo;
pub mod metrics;
pub mod patterns;
pub mod registry;
pub mod schema;
pub mod signals;
pub mod signals_repo;
pub mod supervisor;
pub mod time_range;
pub mod tracks;
pub mod tracks_repo;
pub mod web;
pub mod writer;

pub use config::AppConfig;
pub use kit_health::HealthRecord;
pub use kits::{Kit, KitSource, KitStatus};
pub use signals::SignalRecord;
pub use tracks::TrackRecord;
pub use writer::{BatchOutcome, PersistenceWriter, WriterHandle};
