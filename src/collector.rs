use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

use crate::kit_client::KitClient;
use crate::kits::{Kit, KitStatus};
use crate::kits_repo::KitsRepository;
use crate::registry::KitRegistry;
use crate::supervisor::classify;
use crate::writer::{WriteRequest, WriterHandle};

/// Exponent clamp for the backoff doubling; keeps `2^k` well inside u32
/// long before the delay ceiling takes over anyway.
const BACKOFF_EXP_CAP: u32 = 16;

/// A kit that fails this many polls in a row is marked offline in the
/// registry. It keeps polling at max backoff; the supervisor derives
/// status from `last_seen` once the kit has been reachable at least once.
const OFFLINE_AFTER_FAILURES: u32 = 4;

/// How often the manager reconciles running loops against the registry
/// snapshot.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    pub backoff_cap: Duration,
    pub max_retries: u32,
    pub stale_after: Duration,
    pub offline_after: Duration,
}

/// Per-kit poll bookkeeping. Lives inside one polling loop; never shared.
#[derive(Debug, Clone, Default)]
pub struct KitPollHealth {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl KitPollHealth {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(at);
        self.last_poll_at = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_poll_at = Some(at);
    }

    /// Derived liveness from the last successful poll; same boundary
    /// function the supervisor applies to `last_seen`.
    pub fn status(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        offline_after: Duration,
    ) -> KitStatus {
        classify(self.last_success_at, now, stale_after, offline_after)
    }

    /// `min(base · 2^min(failures, cap), ceiling)`; a success resets the
    /// failure count and with it the delay.
    pub fn poll_delay(&self, base: Duration, ceiling: Duration) -> Duration {
        let factor = 2u32.saturating_pow(self.consecutive_failures.min(BACKOFF_EXP_CAP));
        base.checked_mul(factor).unwrap_or(ceiling).min(ceiling)
    }
}

/// One kit's polling loop. Fetches the three kit endpoints concurrently,
/// hands the normalised batch to the writer, updates poll health, sleeps
/// the backoff-adjusted interval. A kit that reaches max backoff keeps
/// polling there; its failures never touch any other kit's loop.
async fn poll_kit_loop(
    kit: Kit,
    client: KitClient,
    writer: WriterHandle,
    kits_repo: KitsRepository,
    cfg: CollectorConfig,
    cancel: CancellationToken,
) {
    let kit_id = kit.kit_id.clone();
    let Some(api_url) = kit.api_url.clone() else {
        warn!("Kit {kit_id} has no api_url, collector loop refusing to start");
        return;
    };
    info!("Polling {kit_id} at {api_url} every {:?}", cfg.poll_interval);

    let mut health = KitPollHealth::default();
    loop {
        // Backpressure gate: do not start a tick while the writer queue
        // sits above its low-water mark.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = writer.wait_for_capacity() => {}
        }

        let tick_start = std::time::Instant::now();
        let fetches = async {
            tokio::join!(
                client.fetch_drones(&api_url, &kit_id, cfg.max_retries),
                client.fetch_signals(&api_url, &kit_id, cfg.max_retries),
                client.fetch_status(&api_url, &kit_id, cfg.max_retries),
            )
        };
        // In-flight requests abort when the outer scope is cancelled.
        let (drones, signals, status) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = fetches => result,
        };

        let now = Utc::now();
        let mut endpoint_failures = 0u32;

        match drones {
            Ok(records) if !records.is_empty() => {
                if writer.submit(WriteRequest::Tracks(records)).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                endpoint_failures += 1;
                debug!("Kit {kit_id} drones fetch failed: {e}");
            }
        }
        match signals {
            Ok(records) if !records.is_empty() => {
                if writer.submit(WriteRequest::Signals(records)).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                endpoint_failures += 1;
                debug!("Kit {kit_id} signals fetch failed: {e}");
            }
        }
        match status {
            Ok(record) => {
                if writer
                    .submit(WriteRequest::Health(vec![record]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                endpoint_failures += 1;
                debug!("Kit {kit_id} status fetch failed: {e}");
            }
        }

        // The tick counts as a success while any endpoint answers; only a
        // fully dark kit backs off.
        if endpoint_failures < 3 {
            health.record_success(now);
            metrics::counter!("dragnet.collector.polls.ok", "kit" => kit_id.clone())
                .increment(1);
            if writer
                .submit(WriteRequest::TouchKit {
                    kit_id: kit_id.clone(),
                    seen_at: now,
                })
                .await
                .is_err()
            {
                break;
            }
        } else {
            health.record_failure(now);
            metrics::counter!("dragnet.collector.polls.failed", "kit" => kit_id.clone())
                .increment(1);
            // A kit that has never answered has no last_seen for the
            // supervisor to age out; the failure threshold marks it
            // offline here while the loop keeps polling at max backoff.
            if health.consecutive_failures == OFFLINE_AFTER_FAILURES {
                warn!(
                    "Kit {kit_id} offline after {OFFLINE_AFTER_FAILURES} consecutive failures, backoff at {:?}",
                    health.poll_delay(cfg.poll_interval, cfg.backoff_cap)
                );
                let repo = kits_repo.clone();
                let id = kit_id.clone();
                let marked = tokio::task::spawn_blocking(move || {
                    repo.set_status(&id, KitStatus::Offline)
                })
                .await;
                if let Ok(Err(e)) = marked {
                    debug!("Failed to mark {kit_id} offline: {e:#}");
                }
            }
        }
        metrics::histogram!("dragnet.collector.poll_duration_ms", "kit" => kit_id.clone())
            .record(tick_start.elapsed().as_millis() as f64);

        let delay = health.poll_delay(cfg.poll_interval, cfg.backoff_cap);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("Collector loop for {kit_id} stopped");
}

struct RunningLoop {
    api_url: String,
    cancel: CancellationToken,
}

/// The collector manager: reconciles the set of running per-kit loops
/// against the registry snapshot, spawning loops for newly pollable kits
/// and cancelling loops for kits that were disabled, deleted, or repointed
/// at a different URL.
pub fn spawn_collector(
    registry: KitRegistry,
    client: KitClient,
    writer: WriterHandle,
    kits_repo: KitsRepository,
    cfg: CollectorConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            let tracker = TaskTracker::new();
            let mut running: HashMap<String, RunningLoop> = HashMap::new();
            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                reconcile(
                    &registry, &client, &writer, &kits_repo, &cfg, &cancel, &tracker,
                    &mut running,
                );
                metrics::gauge!("dragnet.collector.active_loops").set(running.len() as f64);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
            }

            // Child loops share the root token, so they are already
            // winding down; wait them out within the shutdown grace.
            tracker.close();
            if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
                .await
                .is_err()
            {
                warn!("Collector loops did not stop within grace period");
            }
            info!("Collector manager stopped");
        }
        .instrument(tracing::info_span!("collector")),
    )
}

#[allow(clippy::too_many_arguments)]
fn reconcile(
    registry: &KitRegistry,
    client: &KitClient,
    writer: &WriterHandle,
    kits_repo: &KitsRepository,
    cfg: &CollectorConfig,
    root_cancel: &CancellationToken,
    tracker: &TaskTracker,
    running: &mut HashMap<String, RunningLoop>,
) {
    let kits = registry.kits();

    // Stop loops whose kit vanished, was disabled, or changed URL.
    running.retain(|kit_id, entry| {
        let keep = kits.iter().any(|k| {
            k.kit_id == *kit_id
                && k.pollable()
                && k.api_url.as_deref() == Some(entry.api_url.as_str())
        });
        if !keep {
            info!("Stopping collector loop for {kit_id}");
            entry.cancel.cancel();
        }
        keep
    });

    // Start loops for pollable kits without one.
    for kit in kits.iter().filter(|k| k.pollable()) {
        if running.contains_key(&kit.kit_id) {
            continue;
        }
        let child = root_cancel.child_token();
        running.insert(
            kit.kit_id.clone(),
            RunningLoop {
                api_url: kit.api_url.clone().unwrap_or_default(),
                cancel: child.clone(),
            },
        );
        let span = tracing::info_span!("kit_poller", kit = %kit.kit_id);
        tracker.spawn(
            poll_kit_loop(
                kit.clone(),
                client.clone(),
                writer.clone(),
                kits_repo.clone(),
                cfg.clone(),
                child,
            )
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(300);

    #[test]
    fn test_poll_delay_doubles_until_cap() {
        let mut health = KitPollHealth::default();
        assert_eq!(health.poll_delay(BASE, CAP), Duration::from_secs(5));

        for (failures, expected_secs) in [(1, 10), (2, 20), (3, 40), (4, 80), (5, 160)] {
            health.consecutive_failures = failures;
            assert_eq!(
                health.poll_delay(BASE, CAP),
                Duration::from_secs(expected_secs),
                "failures={failures}"
            );
        }

        // 5 * 2^6 = 320s, clamped to the 300s ceiling, and it stays there.
        health.consecutive_failures = 6;
        assert_eq!(health.poll_delay(BASE, CAP), CAP);
        health.consecutive_failures = 40;
        assert_eq!(health.poll_delay(BASE, CAP), CAP);
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut health = KitPollHealth::default();
        for _ in 0..5 {
            health.record_failure(Utc::now());
        }
        assert!(health.poll_delay(BASE, CAP) > BASE);

        health.record_success(Utc::now());
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.poll_delay(BASE, CAP), BASE);
    }

    #[test]
    fn test_status_follows_last_success() {
        let stale = Duration::from_secs(30);
        let offline = Duration::from_secs(120);
        let now = Utc::now();

        let mut health = KitPollHealth::default();
        assert_eq!(health.status(now, stale, offline), KitStatus::Unknown);

        health.record_success(now - chrono::Duration::seconds(10));
        assert_eq!(health.status(now, stale, offline), KitStatus::Online);

        health.last_success_at = Some(now - chrono::Duration::seconds(45));
        assert_eq!(health.status(now, stale, offline), KitStatus::Stale);

        health.last_success_at = Some(now - chrono::Duration::seconds(500));
        assert_eq!(health.status(now, stale, offline), KitStatus::Offline);

        // Failures do not move last_success_at; only elapsed time does.
        health.record_failure(now);
        assert_eq!(health.status(now, stale, offline), KitStatus::Offline);
    }

    #[test]
    fn test_scenario_polling_failover_backoff() {
        // After >= 4 failures a kit's interval has grown to >= 40s while a
        // healthy kit stays at the base interval.
        let mut down = KitPollHealth::default();
        for _ in 0..4 {
            down.record_failure(Utc::now());
        }
        assert!(down.poll_delay(BASE, CAP) >= Duration::from_secs(40));

        let mut up = KitPollHealth::default();
        up.record_success(Utc::now());
        assert_eq!(up.poll_delay(BASE, CAP), BASE);
    }
}
