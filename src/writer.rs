use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{Instrument, debug, error, info, warn};

use crate::db::PgPool;
use crate::health_repo::HealthRepository;
use crate::kit_health::HealthRecord;
use crate::kits::KitUpsert;
use crate::kits_repo::KitsRepository;
use crate::signals::SignalRecord;
use crate::signals_repo::SignalsRepository;
use crate::tracks::TrackRecord;
use crate::tracks_repo::TracksRepository;

/// Queue capacity of the writer intake channel. Sends block when full,
/// which is the ingestion backpressure high-water mark.
pub const WRITE_QUEUE_SIZE: usize = 1000;

/// Ingestion loops pause while the queue sits above this many entries.
pub const WRITE_QUEUE_LOW_WATER: usize = WRITE_QUEUE_SIZE / 2;

const INSERT_ATTEMPTS: u32 = 3;
const INSERT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Per-batch insert outcome. Conflicts are idempotent re-ingest, rejects
/// are schema violations; neither aborts the rest of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub conflicted: usize,
    pub rejected: usize,
}

/// A unit of work handed to the writer task. Kit mutations ride the same
/// ordered channel as telemetry so auto-registration lands before the
/// first rows that reference the new kit.
#[derive(Debug)]
pub enum WriteRequest {
    Tracks(Vec<TrackRecord>),
    Signals(Vec<SignalRecord>),
    Health(Vec<HealthRecord>),
    UpsertKit(KitUpsert),
    TouchKit {
        kit_id: String,
        seen_at: DateTime<Utc>,
    },
}

/// Cloneable producer side of the write queue.
#[derive(Clone)]
pub struct WriterHandle {
    tx: flume::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Enqueue, blocking (async) while the queue is at capacity.
    pub async fn submit(&self, req: WriteRequest) -> Result<()> {
        self.tx
            .send_async(req)
            .await
            .map_err(|_| anyhow::anyhow!("write queue closed"))
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    /// Backpressure gate: hold the caller until the queue drains below the
    /// low-water mark.
    pub async fn wait_for_capacity(&self) {
        while self.tx.len() > WRITE_QUEUE_LOW_WATER {
            metrics::counter!("dragnet.writer.backpressure_waits").increment(1);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// The single component that mutates telemetry storage. Validates rows,
/// chunks batches, ignores composite-key conflicts, and retries transient
/// store failures with exponential backoff.
#[derive(Clone)]
pub struct PersistenceWriter {
    tracks: TracksRepository,
    signals: SignalsRepository,
    health: HealthRepository,
    kits: KitsRepository,
    batch_size: usize,
}

impl PersistenceWriter {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            tracks: TracksRepository::new(pool.clone()),
            signals: SignalsRepository::new(pool.clone()),
            health: HealthRepository::new(pool.clone()),
            kits: KitsRepository::new(pool),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn insert_tracks(&self, records: Vec<TrackRecord>) -> Result<BatchOutcome> {
        let (valid, rejected) = partition_valid(records, TrackRecord::validate, "track");
        let mut outcome = BatchOutcome {
            rejected,
            ..Default::default()
        };
        for chunk in valid.chunks(self.batch_size) {
            let repo = self.tracks.clone();
            let batch = chunk.to_vec();
            let attempted = batch.len();
            let inserted = retry_blocking(move || repo.insert_batch(&batch)).await?;
            outcome.inserted += inserted;
            outcome.conflicted += attempted - inserted;
        }
        metrics::counter!("dragnet.writer.tracks.inserted").increment(outcome.inserted as u64);
        metrics::counter!("dragnet.writer.tracks.conflicted").increment(outcome.conflicted as u64);
        metrics::counter!("dragnet.writer.tracks.rejected").increment(outcome.rejected as u64);
        Ok(outcome)
    }

    pub async fn insert_signals(&self, records: Vec<SignalRecord>) -> Result<BatchOutcome> {
        let (valid, rejected) = partition_valid(records, SignalRecord::validate, "signal");
        let mut outcome = BatchOutcome {
            rejected,
            ..Default::default()
        };
        for chunk in valid.chunks(self.batch_size) {
            let repo = self.signals.clone();
            let batch = chunk.to_vec();
            let attempted = batch.len();
            let inserted = retry_blocking(move || repo.insert_batch(&batch)).await?;
            outcome.inserted += inserted;
            outcome.conflicted += attempted - inserted;
        }
        metrics::counter!("dragnet.writer.signals.inserted").increment(outcome.inserted as u64);
        metrics::counter!("dragnet.writer.signals.conflicted")
            .increment(outcome.conflicted as u64);
        metrics::counter!("dragnet.writer.signals.rejected").increment(outcome.rejected as u64);
        Ok(outcome)
    }

    pub async fn insert_health(&self, records: Vec<HealthRecord>) -> Result<BatchOutcome> {
        let (valid, rejected) = partition_valid(records, HealthRecord::validate, "health");
        let mut outcome = BatchOutcome {
            rejected,
            ..Default::default()
        };
        for chunk in valid.chunks(self.batch_size) {
            let repo = self.health.clone();
            let batch = chunk.to_vec();
            let attempted = batch.len();
            let inserted = retry_blocking(move || repo.insert_batch(&batch)).await?;
            outcome.inserted += inserted;
            outcome.conflicted += attempted - inserted;
        }
        metrics::counter!("dragnet.writer.health.inserted").increment(outcome.inserted as u64);
        metrics::counter!("dragnet.writer.health.conflicted")
            .increment(outcome.conflicted as u64);
        metrics::counter!("dragnet.writer.health.rejected").increment(outcome.rejected as u64);
        Ok(outcome)
    }

    pub async fn upsert_kit(&self, req: KitUpsert) -> Result<()> {
        let repo = self.kits.clone();
        retry_blocking(move || repo.upsert(&req)).await
    }

    pub async fn touch_kit(&self, kit_id: String, seen_at: DateTime<Utc>) -> Result<()> {
        let repo = self.kits.clone();
        retry_blocking(move || repo.touch(&kit_id, seen_at)).await
    }
}

/// Validate a batch, logging each rejected row with a digest. Row-level
/// failures never abort the batch.
fn partition_valid<T>(
    records: Vec<T>,
    validate: impl Fn(&T) -> Result<(), String>,
    kind: &str,
) -> (Vec<T>, usize)
where
    T: std::fmt::Debug,
{
    let mut valid = Vec::with_capacity(records.len());
    let mut rejected = 0;
    for record in records {
        match validate(&record) {
            Ok(()) => valid.push(record),
            Err(reason) => {
                rejected += 1;
                warn!("Rejected {kind} row ({reason}): {record:?}");
            }
        }
    }
    (valid, rejected)
}

/// Exponential backoff for one retry attempt.
fn retry_delay(attempt: u32) -> Duration {
    INSERT_BACKOFF_BASE * 2u32.saturating_pow(attempt)
}

/// Run a blocking repository call on the blocking pool, retrying transient
/// store errors. Permanent errors surface immediately.
async fn retry_blocking<T, F>(op: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn() -> Result<T> + Send + Sync + Clone + 'static,
{
    let mut last_err = None;
    for attempt in 0..INSERT_ATTEMPTS {
        let op = op.clone();
        match tokio::task::spawn_blocking(op).await? {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                if attempt + 1 < INSERT_ATTEMPTS {
                    let delay = retry_delay(attempt);
                    warn!(
                        "Transient store error (attempt {}/{}), retrying in {:?}: {e:#}",
                        attempt + 1,
                        INSERT_ATTEMPTS,
                        delay
                    );
                    metrics::counter!("dragnet.writer.transient_retries").increment(1);
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("store retries exhausted")))
}

/// Connection-level failures are worth retrying; constraint and data
/// errors are not.
fn is_transient(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<r2d2::Error>().is_some() {
        return true;
    }
    match err.downcast_ref::<diesel::result::Error>() {
        Some(diesel::result::Error::DatabaseError(kind, _)) => matches!(
            *kind,
            diesel::result::DatabaseErrorKind::ClosedConnection
                | diesel::result::DatabaseErrorKind::SerializationFailure
        ),
        Some(_) => false,
        // r2d2 pool errors arrive wrapped in context; fall back to the
        // message for the connection-drop case.
        None => {
            let msg = format!("{err:#}");
            msg.contains("connection") || msg.contains("timed out")
        }
    }
}

/// The writer task: drains the intake queue until every producer hangs up,
/// then exits. Shutdown is therefore "cancel the producers, let the queue
/// drain".
pub fn spawn_writer(
    writer: PersistenceWriter,
) -> (WriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = flume::bounded::<WriteRequest>(WRITE_QUEUE_SIZE);
    let handle = WriterHandle { tx };

    let task = tokio::spawn(
        async move {
            info!("Persistence writer started (queue capacity {WRITE_QUEUE_SIZE})");
            let mut batches = 0u64;
            while let Ok(req) = rx.recv_async().await {
                metrics::gauge!("dragnet.writer.queue_depth").set(rx.len() as f64);
                let result = match req {
                    WriteRequest::Tracks(records) => {
                        writer.insert_tracks(records).await.map(Some)
                    }
                    WriteRequest::Signals(records) => {
                        writer.insert_signals(records).await.map(Some)
                    }
                    WriteRequest::Health(records) => {
                        writer.insert_health(records).await.map(Some)
                    }
                    WriteRequest::UpsertKit(req) => writer.upsert_kit(req).await.map(|_| None),
                    WriteRequest::TouchKit { kit_id, seen_at } => {
                        writer.touch_kit(kit_id, seen_at).await.map(|_| None)
                    }
                };
                match result {
                    Ok(Some(outcome)) => {
                        batches += 1;
                        if outcome.rejected > 0 {
                            debug!(
                                "Batch stored: {} inserted, {} conflicted, {} rejected",
                                outcome.inserted, outcome.conflicted, outcome.rejected
                            );
                        }
                    }
                    Ok(None) => {}
                    // Retries are exhausted at this point; the tick or
                    // message is dropped and ingestion continues.
                    Err(e) => {
                        error!("Write failed after retries, dropping batch: {e:#}");
                        metrics::counter!("dragnet.writer.dropped_batches").increment(1);
                    }
                }
            }
            info!("Persistence writer drained after {batches} batches, stopping");
        }
        .instrument(tracing::info_span!("writer")),
    );

    (handle, task)
}

/// Wait out the writer drain with a bounded grace period.
pub async fn join_writer(task: tokio::task::JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, task).await.is_err() {
        warn!("Writer did not drain within {grace:?}, abandoning queue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::TRACK_TYPE_DRONE;

    fn record(kit: &str, drone: &str, lat: f64) -> TrackRecord {
        TrackRecord {
            time: Utc::now(),
            kit_id: kit.to_string(),
            drone_id: drone.to_string(),
            track_type: TRACK_TYPE_DRONE.to_string(),
            lat: Some(lat),
            lon: Some(0.5),
            alt: None,
            speed: None,
            heading: None,
            vspeed: None,
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
            rssi: None,
            freq_mhz: None,
        }
    }

    #[test]
    fn test_partition_keeps_valid_rows() {
        let records = vec![
            record("kit-1", "d1", 10.0),
            record("kit-1", "", 10.0),
            record("kit-1", "d2", 95.0),
            record("kit-1", "d3", -45.0),
        ];
        let (valid, rejected) = partition_valid(records, TrackRecord::validate, "track");
        assert_eq!(valid.len(), 2);
        assert_eq!(rejected, 2);
        assert_eq!(valid[0].drone_id, "d1");
        assert_eq!(valid[1].drone_id, "d3");
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(0), Duration::from_millis(100));
        assert_eq!(retry_delay(1), Duration::from_millis(200));
        assert_eq!(retry_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_low_water_below_capacity() {
        assert!(WRITE_QUEUE_LOW_WATER < WRITE_QUEUE_SIZE);
    }
}
