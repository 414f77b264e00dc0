use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use crate::kits::KitStatus;
use crate::registry::KitRegistry;

/// Classify liveness from the time since a kit was last seen.
///
/// - `online`  while `elapsed < stale_after`
/// - `stale`   while `stale_after <= elapsed < offline_after`
/// - `offline` from `offline_after` on
/// - `unknown` when the kit has never been seen
pub fn classify(
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_after: Duration,
    offline_after: Duration,
) -> KitStatus {
    let Some(seen) = last_seen else {
        return KitStatus::Unknown;
    };
    let elapsed = (now - seen).to_std().unwrap_or(Duration::ZERO);
    if elapsed < stale_after {
        KitStatus::Online
    } else if elapsed < offline_after {
        KitStatus::Stale
    } else {
        KitStatus::Offline
    }
}

/// Periodic rollup: recompute every kit's status from `last_seen`, persist
/// the ones that changed, then refresh the registry snapshot the read API
/// serves from. The supervisor is the only component that writes `status`.
pub fn spawn_supervisor(
    registry: KitRegistry,
    stale_after: Duration,
    offline_after: Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            info!("Health supervisor sweeping every {sweep_interval:?}");
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let now = Utc::now();
                let kits = registry.kits();
                let mut changed = 0usize;
                for kit in kits.iter() {
                    // A kit that has never been seen keeps whatever the
                    // collector recorded (unknown, or offline after the
                    // failure threshold); there is nothing to age out.
                    if kit.last_seen.is_none() {
                        continue;
                    }
                    let status = classify(kit.last_seen, now, stale_after, offline_after);
                    if status != kit.status {
                        match registry.repo().set_status(&kit.kit_id, status) {
                            Ok(n) => {
                                changed += n;
                                if n > 0 {
                                    info!("Kit {} is now {status}", kit.kit_id);
                                }
                            }
                            Err(e) => {
                                warn!("Failed to roll up status for {}: {e:#}", kit.kit_id)
                            }
                        }
                    }
                }
                metrics::gauge!("dragnet.supervisor.kits_total").set(kits.len() as f64);
                if let Err(e) = registry.refresh() {
                    warn!("Failed to refresh registry snapshot: {e:#}");
                } else if changed > 0 {
                    metrics::counter!("dragnet.supervisor.status_changes")
                        .increment(changed as u64);
                }
            }
            info!("Health supervisor stopped");
        }
        .instrument(tracing::info_span!("supervisor")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const STALE: Duration = Duration::from_secs(30);
    const OFFLINE: Duration = Duration::from_secs(120);

    fn at(secs_ago: i64) -> (Option<DateTime<Utc>>, DateTime<Utc>) {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        (Some(now - chrono::Duration::seconds(secs_ago)), now)
    }

    #[test]
    fn test_never_seen_is_unknown() {
        let now = Utc::now();
        assert_eq!(classify(None, now, STALE, OFFLINE), KitStatus::Unknown);
    }

    #[test]
    fn test_boundaries_exact() {
        // Just inside online.
        let (seen, now) = at(29);
        assert_eq!(classify(seen, now, STALE, OFFLINE), KitStatus::Online);
        // The stale threshold itself is stale.
        let (seen, now) = at(30);
        assert_eq!(classify(seen, now, STALE, OFFLINE), KitStatus::Stale);
        let (seen, now) = at(119);
        assert_eq!(classify(seen, now, STALE, OFFLINE), KitStatus::Stale);
        // The offline threshold itself is offline.
        let (seen, now) = at(120);
        assert_eq!(classify(seen, now, STALE, OFFLINE), KitStatus::Offline);
        let (seen, now) = at(100_000);
        assert_eq!(classify(seen, now, STALE, OFFLINE), KitStatus::Offline);
    }

    #[test]
    fn test_future_last_seen_counts_as_online() {
        // A kit whose clock runs slightly ahead must not flap.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let seen = Some(now + chrono::Duration::seconds(3));
        assert_eq!(classify(seen, now, STALE, OFFLINE), KitStatus::Online);
    }
}
