//! Store-backed ingest properties: idempotent replay, composite-key
//! uniqueness, dedup semantics, and the kit source lattice. Requires
//! `TEST_DATABASE_URL`; skipped otherwise.

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::TestDatabase;

use dragnet::kits::{KitSource, KitUpsert, NewKit};
use dragnet::kits_repo::KitsRepository;
use dragnet::time_range::TimeRange;
use dragnet::tracks::{TRACK_TYPE_DRONE, TrackRecord};
use dragnet::tracks_repo::{TrackQuery, TracksRepository};
use dragnet::writer::PersistenceWriter;

fn track(kit: &str, drone: &str, offset_secs: i64) -> TrackRecord {
    TrackRecord {
        time: Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
            + Duration::seconds(offset_secs),
        kit_id: kit.to_string(),
        drone_id: drone.to_string(),
        track_type: TRACK_TYPE_DRONE.to_string(),
        lat: Some(40.0),
        lon: Some(-74.0),
        alt: Some(100.0),
        speed: Some(5.0),
        heading: None,
        vspeed: None,
        height: None,
        direction: None,
        operator_id: None,
        caa_id: None,
        rid_make: Some("DJI".to_string()),
        rid_model: None,
        rid_source: None,
        pilot_lat: None,
        pilot_lon: None,
        home_lat: None,
        home_lon: None,
        mac: None,
        rssi: Some(-70.0),
        freq_mhz: Some(2437.0),
    }
}

fn window() -> TimeRange {
    TimeRange {
        start: Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap(),
    }
}

fn seed_kit(repo: &KitsRepository, kit_id: &str) {
    repo.seed(&NewKit {
        kit_id: kit_id.to_string(),
        name: kit_id.to_string(),
        location: None,
        api_url: Some(format!("http://{kit_id}.local:8080")),
        source: KitSource::Http,
        enabled: true,
    })
    .expect("seeding kit");
}

#[tokio::test]
async fn test_replaying_a_batch_is_idempotent() {
    let Some(db) = TestDatabase::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let writer = PersistenceWriter::new(db.pool(), 1000);
    seed_kit(&KitsRepository::new(db.pool()), "kit-a");

    let batch: Vec<TrackRecord> = (0..10).map(|i| track("kit-a", "drone-1", i)).collect();

    let first = writer.insert_tracks(batch.clone()).await.unwrap();
    assert_eq!(first.inserted, 10);
    assert_eq!(first.conflicted, 0);
    assert_eq!(first.rejected, 0);

    let replay = writer.insert_tracks(batch).await.unwrap();
    assert_eq!(replay.inserted, 0);
    assert_eq!(replay.conflicted, 10);

    let rows = TracksRepository::new(db.pool())
        .in_window(&window(), 1000)
        .unwrap();
    assert_eq!(rows.len(), 10);
}

#[tokio::test]
async fn test_rejected_rows_do_not_abort_the_batch() {
    let Some(db) = TestDatabase::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let writer = PersistenceWriter::new(db.pool(), 1000);
    seed_kit(&KitsRepository::new(db.pool()), "kit-a");

    let mut bad = track("kit-a", "drone-2", 100);
    bad.lat = Some(123.0);
    let batch = vec![track("kit-a", "drone-1", 0), bad, track("kit-a", "drone-3", 200)];

    let outcome = writer.insert_tracks(batch).await.unwrap();
    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.rejected, 1);

    let rows = TracksRepository::new(db.pool())
        .in_window(&window(), 1000)
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_deduplicate_returns_latest_row_per_drone() {
    let Some(db) = TestDatabase::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let writer = PersistenceWriter::new(db.pool(), 1000);
    seed_kit(&KitsRepository::new(db.pool()), "kit-a");
    seed_kit(&KitsRepository::new(db.pool()), "kit-b");

    // The same drone from two kits plus a replay, as if the collector and
    // the bus both delivered it.
    let rows = vec![
        track("kit-a", "drone-1", 0),
        track("kit-b", "drone-1", 0),
        track("kit-a", "drone-1", 60),
        track("kit-a", "drone-2", 30),
    ];
    writer.insert_tracks(rows.clone()).await.unwrap();
    writer.insert_tracks(rows).await.unwrap();

    let repo = TracksRepository::new(db.pool());
    let deduped = repo
        .query(&TrackQuery {
            range: window(),
            kit_ids: None,
            rid_make: None,
            track_type: None,
            limit: 100,
            deduplicate: true,
        })
        .unwrap();

    assert_eq!(deduped.len(), 2);
    let d1 = deduped.iter().find(|t| t.drone_id == "drone-1").unwrap();
    // argmax time wins.
    assert_eq!(
        d1.time,
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 1, 0).unwrap()
    );
}

#[tokio::test]
async fn test_source_lattice_is_monotone_in_store() {
    let Some(db) = TestDatabase::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let repo = KitsRepository::new(db.pool());
    seed_kit(&repo, "kit-hybrid");

    // Bus sighting of an http kit promotes to both.
    repo.upsert(&KitUpsert::auto_registered("kit-hybrid")).unwrap();
    let kit = repo.get_by_id("kit-hybrid").unwrap().unwrap();
    assert_eq!(kit.source, KitSource::Both);

    // No later sighting can demote it.
    repo.upsert(&KitUpsert {
        kit_id: "kit-hybrid".to_string(),
        name: None,
        location: None,
        api_url: None,
        source: KitSource::Http,
        enabled: None,
    })
    .unwrap();
    let kit = repo.get_by_id("kit-hybrid").unwrap().unwrap();
    assert_eq!(kit.source, KitSource::Both);
}

#[tokio::test]
async fn test_auto_registration_creates_mqtt_kit() {
    let Some(db) = TestDatabase::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let repo = KitsRepository::new(db.pool());

    repo.upsert(&KitUpsert::auto_registered("wardragon-new")).unwrap();
    let kit = repo.get_by_id("wardragon-new").unwrap().unwrap();
    assert_eq!(kit.source, KitSource::Mqtt);
    assert_eq!(kit.api_url, None);
    assert!(kit.enabled);
    assert_eq!(kit.name, "wardragon-new");
}

#[tokio::test]
async fn test_touch_kit_only_advances() {
    let Some(db) = TestDatabase::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let repo = KitsRepository::new(db.pool());
    seed_kit(&repo, "kit-a");

    let later = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
    let earlier = later - Duration::minutes(10);

    repo.touch("kit-a", later).unwrap();
    repo.touch("kit-a", earlier).unwrap();

    let kit = repo.get_by_id("kit-a").unwrap().unwrap();
    assert_eq!(kit.last_seen, Some(later));
}

#[tokio::test]
async fn test_admin_tombstone_survives_reseeding() {
    let Some(db) = TestDatabase::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let repo = KitsRepository::new(db.pool());
    seed_kit(&repo, "kit-gone");

    assert!(repo.admin_delete("kit-gone", false).unwrap());
    let kit = repo.get_by_id("kit-gone").unwrap().unwrap();
    assert!(!kit.enabled);
    assert!(kit.disabled_by_admin);

    // Config reseeding must not resurrect it.
    seed_kit(&repo, "kit-gone");
    let kit = repo.get_by_id("kit-gone").unwrap().unwrap();
    assert!(!kit.enabled);

    // Nor can bus auto-registration re-enable it.
    repo.upsert(&KitUpsert::auto_registered("kit-gone")).unwrap();
    let kit = repo.get_by_id("kit-gone").unwrap().unwrap();
    assert!(!kit.enabled);
    assert!(kit.disabled_by_admin);
}
