use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::config::MqttConfig;
use crate::kit_health::HealthRecord;
use crate::kits::KitUpsert;
use crate::registry::KitRegistry;
use crate::signals::SignalRecord;
use crate::tracks::{TRACK_TYPE_AIRCRAFT, TRACK_TYPE_DRONE, TrackRecord};
use crate::writer::{WriteRequest, WriterHandle};

pub const TOPIC_DRONES: &str = "wardragon/drones";
pub const TOPIC_DRONE_PREFIX: &str = "wardragon/drone/";
pub const TOPIC_AIRCRAFT: &str = "wardragon/aircraft";
pub const TOPIC_SIGNALS: &str = "wardragon/signals";
pub const TOPIC_SYSTEM: &str = "wardragon/system/attrs";

/// Advance a bus kit's `last_seen` at most this often.
const TOUCH_INTERVAL: Duration = Duration::from_secs(5);

/// Drone payload as published on the bus. Kits publish both naming
/// conventions in the wild; the internal name wins when both are present.
#[derive(Debug, Deserialize)]
pub struct BusDrone {
    #[serde(alias = "drone_id")]
    pub id: String,
    pub seen_by: Option<String>,
    pub kit_id: Option<String>,
    pub lat: Option<f64>,
    pub latitude: Option<f64>,
    pub lon: Option<f64>,
    pub longitude: Option<f64>,
    pub alt: Option<f64>,
    pub hae: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub vspeed: Option<f64>,
    pub height: Option<f64>,
    pub direction: Option<f64>,
    pub operator_id: Option<String>,
    pub caa_id: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub source: Option<String>,
    pub pilot_lat: Option<f64>,
    pub pilot_lon: Option<f64>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub mac: Option<String>,
    pub rssi: Option<f64>,
    pub freq: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// ADS-B aircraft payload (`wardragon/aircraft`).
#[derive(Debug, Deserialize)]
pub struct BusAircraft {
    #[serde(alias = "icao")]
    pub hex: String,
    pub seen_by: Option<String>,
    pub kit_id: Option<String>,
    pub lat: Option<f64>,
    pub latitude: Option<f64>,
    pub lon: Option<f64>,
    pub longitude: Option<f64>,
    pub alt: Option<f64>,
    pub hae: Option<f64>,
    pub speed: Option<f64>,
    #[serde(alias = "track")]
    pub heading: Option<f64>,
    pub vspeed: Option<f64>,
    pub rssi: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Signal payload (`wardragon/signals`).
#[derive(Debug, Deserialize)]
pub struct BusSignal {
    pub seen_by: Option<String>,
    pub kit_id: Option<String>,
    pub freq_mhz: f64,
    pub power_dbm: Option<f64>,
    pub bandwidth_mhz: Option<f64>,
    pub lat: Option<f64>,
    pub latitude: Option<f64>,
    pub lon: Option<f64>,
    pub longitude: Option<f64>,
    pub detection_type: Option<String>,
    pub stage: Option<String>,
    pub pal_confidence: Option<f64>,
    pub ntsc_confidence: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// System health payload (`wardragon/system/attrs`) with the
/// broadcast-friendly field names.
#[derive(Debug, Deserialize)]
pub struct BusHealth {
    pub seen_by: Option<String>,
    pub kit_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub hae: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub memory_available_mb: Option<f64>,
    pub disk_total_mb: Option<f64>,
    pub disk_used_mb: Option<f64>,
    pub uptime_s: Option<f64>,
    pub temperature: Option<f64>,
    pub gpu_temperature: Option<f64>,
    pub sdr_temperature: Option<f64>,
    pub gps_speed: Option<f64>,
    pub gps_track: Option<f64>,
    pub gps_fix: Option<bool>,
    pub timestamp: Option<DateTime<Utc>>,
}

fn observer(seen_by: &Option<String>, kit_id: &Option<String>) -> Option<String> {
    seen_by
        .clone()
        .or_else(|| kit_id.clone())
        .filter(|s| !s.is_empty())
}

pub fn drone_to_record(d: BusDrone, now: DateTime<Utc>) -> Option<(String, TrackRecord)> {
    let kit = observer(&d.seen_by, &d.kit_id)?;
    let record = TrackRecord {
        time: d.timestamp.unwrap_or(now),
        kit_id: kit.clone(),
        drone_id: d.id,
        track_type: TRACK_TYPE_DRONE.to_string(),
        lat: d.lat.or(d.latitude),
        lon: d.lon.or(d.longitude),
        alt: d.alt.or(d.hae),
        speed: d.speed,
        heading: d.heading,
        vspeed: d.vspeed,
        height: d.height,
        direction: d.direction,
        operator_id: d.operator_id,
        caa_id: d.caa_id,
        rid_make: d.make,
        rid_model: d.model,
        rid_source: d.source,
        pilot_lat: d.pilot_lat,
        pilot_lon: d.pilot_lon,
        home_lat: d.home_lat,
        home_lon: d.home_lon,
        mac: d.mac,
        rssi: d.rssi,
        freq_mhz: d.freq,
    };
    Some((kit, record))
}

pub fn aircraft_to_record(a: BusAircraft, now: DateTime<Utc>) -> Option<(String, TrackRecord)> {
    let kit = observer(&a.seen_by, &a.kit_id)?;
    let record = TrackRecord {
        time: a.timestamp.unwrap_or(now),
        kit_id: kit.clone(),
        drone_id: a.hex,
        track_type: TRACK_TYPE_AIRCRAFT.to_string(),
        lat: a.lat.or(a.latitude),
        lon: a.lon.or(a.longitude),
        alt: a.alt.or(a.hae),
        speed: a.speed,
        heading: a.heading,
        vspeed: a.vspeed,
        height: None,
        direction: None,
        operator_id: None,
        caa_id: None,
        rid_make: None,
        rid_model: None,
        rid_source: None,
        pilot_lat: None,
        pilot_lon: None,
        home_lat: None,
        home_lon: None,
        mac: None,
        rssi: a.rssi,
        freq_mhz: None,
    };
    Some((kit, record))
}

pub fn signal_to_record(s: BusSignal, now: DateTime<Utc>) -> Option<(String, SignalRecord)> {
    let kit = observer(&s.seen_by, &s.kit_id)?;
    let record = SignalRecord {
        time: s.timestamp.unwrap_or(now),
        kit_id: kit.clone(),
        freq_mhz: s.freq_mhz,
        power_dbm: s.power_dbm,
        bandwidth_mhz: s.bandwidth_mhz,
        lat: s.lat.or(s.latitude),
        lon: s.lon.or(s.longitude),
        detection_type: s
            .detection_type
            .unwrap_or_else(|| crate::signals::DETECTION_ANALOG.to_string()),
        stage: s
            .stage
            .unwrap_or_else(|| crate::signals::STAGE_GUARD.to_string()),
        pal_confidence: s.pal_confidence,
        ntsc_confidence: s.ntsc_confidence,
    };
    Some((kit, record))
}

/// The deterministic broadcast-name remap of the health payload:
/// memory/disk totals collapse to percentages, `uptime_s` to hours,
/// `temperature` to the CPU sensor.
pub fn health_to_record(h: BusHealth, now: DateTime<Utc>) -> Option<(String, HealthRecord)> {
    let kit = observer(&h.seen_by, &h.kit_id)?;

    let memory_percent = match (h.memory_total_mb, h.memory_available_mb) {
        (Some(total), Some(avail)) if total > 0.0 => Some((total - avail) / total * 100.0),
        _ => None,
    };
    let disk_percent = match (h.disk_total_mb, h.disk_used_mb) {
        (Some(total), Some(used)) if total > 0.0 => Some(used / total * 100.0),
        _ => None,
    };

    let record = HealthRecord {
        time: h.timestamp.unwrap_or(now),
        kit_id: kit.clone(),
        lat: h.latitude,
        lon: h.longitude,
        alt: h.hae,
        cpu_percent: h.cpu_usage,
        memory_percent,
        disk_percent,
        uptime_hours: h.uptime_s.map(|s| s / 3600.0),
        temp_cpu: h.temperature,
        temp_gpu: h.gpu_temperature,
        temp_sdr: h.sdr_temperature,
        gps_speed: h.gps_speed,
        gps_track: h.gps_track,
        gps_fix: h.gps_fix,
    };
    Some((kit, record))
}

/// Long-lived bus subscriber. Delivery is at-least-once from the broker;
/// the writer's composite-key conflict handling makes re-delivery
/// idempotent. A malformed payload is dropped with a metric bump and
/// never restarts the subscription.
pub struct BusSubscriber {
    config: MqttConfig,
    registry: KitRegistry,
    writer: WriterHandle,
    registered: HashSet<String>,
    last_touch: HashMap<String, DateTime<Utc>>,
}

impl BusSubscriber {
    pub fn new(config: MqttConfig, registry: KitRegistry, writer: WriterHandle) -> Self {
        Self {
            config,
            registry,
            writer,
            registered: HashSet::new(),
            last_touch: HashMap::new(),
        }
    }

    fn mqtt_options(&self) -> Result<MqttOptions> {
        let trimmed = self
            .config
            .url
            .trim_start_matches("mqtt://")
            .trim_start_matches("mqtts://")
            .trim_start_matches("tcp://");
        let (host, port) = match trimmed.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse::<u16>()
                    .with_context(|| format!("invalid MQTT port in '{}'", self.config.url))?,
            ),
            None => (
                trimmed.to_string(),
                if self.config.tls { 8883 } else { 1883 },
            ),
        };

        let mut opts = MqttOptions::new("dragnet-ingest", host, port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        if self.config.tls || self.config.url.starts_with("mqtts://") {
            opts.set_transport(Transport::tls_with_default_config());
        }
        Ok(opts)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let opts = self.mqtt_options()?;
        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        info!("Bus subscriber connecting to {}", self.config.url);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to bus, subscribing to wardragon topics");
                    for topic in [
                        TOPIC_DRONES,
                        "wardragon/drone/+",
                        TOPIC_AIRCRAFT,
                        TOPIC_SIGNALS,
                        TOPIC_SYSTEM,
                    ] {
                        client.subscribe(topic, QoS::AtLeastOnce).await?;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Backpressure: hold before handing the message on, so
                    // unacknowledged messages stay queued at the broker.
                    self.writer.wait_for_capacity().await;
                    self.handle_message(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Bus connection error, retrying in 1s: {e}");
                    metrics::counter!("dragnet.bus.connection_errors").increment(1);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!("Bus subscriber stopped");
        Ok(())
    }

    async fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let now = Utc::now();
        let outcome = if topic == TOPIC_DRONES || topic.starts_with(TOPIC_DRONE_PREFIX) {
            serde_json::from_slice::<BusDrone>(payload)
                .ok()
                .and_then(|d| drone_to_record(d, now))
                .map(|(kit, rec)| (kit, WriteRequest::Tracks(vec![rec])))
        } else if topic == TOPIC_AIRCRAFT {
            serde_json::from_slice::<BusAircraft>(payload)
                .ok()
                .and_then(|a| aircraft_to_record(a, now))
                .map(|(kit, rec)| (kit, WriteRequest::Tracks(vec![rec])))
        } else if topic == TOPIC_SIGNALS {
            serde_json::from_slice::<BusSignal>(payload)
                .ok()
                .and_then(|s| signal_to_record(s, now))
                .map(|(kit, rec)| (kit, WriteRequest::Signals(vec![rec])))
        } else if topic == TOPIC_SYSTEM {
            serde_json::from_slice::<BusHealth>(payload)
                .ok()
                .and_then(|h| health_to_record(h, now))
                .map(|(kit, rec)| (kit, WriteRequest::Health(vec![rec])))
        } else {
            debug!("Ignoring message on unexpected topic {topic}");
            return;
        };

        let Some((kit_id, request)) = outcome else {
            metrics::counter!("dragnet.bus.malformed_messages").increment(1);
            debug!(
                "Dropping malformed bus message on {topic} ({} bytes)",
                payload.len()
            );
            return;
        };

        // First sighting this session: upsert so unknown kits register as
        // mqtt and existing http kits promote to both. Ordered ahead of
        // the telemetry on the same queue.
        if !self.registered.contains(&kit_id) {
            let known = self.registry.get(&kit_id).is_some();
            let upsert = KitUpsert::auto_registered(&kit_id);
            if self.writer.submit(WriteRequest::UpsertKit(upsert)).await.is_err() {
                return;
            }
            self.registered.insert(kit_id.clone());
            if !known {
                info!("Auto-registered kit {kit_id} from bus traffic");
                metrics::counter!("dragnet.bus.kits_auto_registered").increment(1);
            }
        }

        let touch_due = self
            .last_touch
            .get(&kit_id)
            .is_none_or(|last| (now - *last).to_std().unwrap_or_default() >= TOUCH_INTERVAL);
        if touch_due {
            self.last_touch.insert(kit_id.clone(), now);
            let _ = self
                .writer
                .submit(WriteRequest::TouchKit {
                    kit_id: kit_id.clone(),
                    seen_at: now,
                })
                .await;
        }

        if self.writer.submit(request).await.is_ok() {
            metrics::counter!("dragnet.bus.messages_consumed").increment(1);
        }
    }
}

/// Spawn the subscriber as a supervised task.
pub fn spawn_bus_subscriber(
    config: MqttConfig,
    registry: KitRegistry,
    writer: WriterHandle,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            let subscriber = BusSubscriber::new(config, registry, writer);
            if let Err(e) = subscriber.run(cancel).await {
                warn!("Bus subscriber exited with error: {e:#}");
            }
        }
        .instrument(tracing::info_span!("bus_subscriber")),
    )
}
