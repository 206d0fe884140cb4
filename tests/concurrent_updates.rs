//! Concurrent ingestion and query stress tests.
//!
//! Several feeder threads record fixes while readers rank the fleet and ask
//! for wind, the way a live tracking server uses a race.
//!
//! Heavy tests are `#[ignore]` by default. Run them with:
//!   `cargo test --test concurrent_updates --release -- --ignored --nocapture`

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use sailing_analytics::{
    with_registry, Bearing, BoatClass, Competitor, Course, GpsFix, GpsFixMoving, MarkPassing, Position, RaceConfig,
    Speed, SpeedWithBearing, TimePoint, TrackedRace, Waypoint,
};

/// Helper: race with `boats` competitors on a windward-leeward course.
fn fleet_race(id: &str, boats: usize) -> TrackedRace {
    let course = Course::new(
        "windward-leeward",
        vec![
            Waypoint::mark("start", "committee".into()),
            Waypoint::mark("top", "windward".into()),
            Waypoint::mark("finish", "committee".into()),
        ],
    )
    .expect("valid course");
    let competitors = (0..boats)
        .map(|i| Competitor::new(format!("boat-{i}"), format!("Boat {i}")))
        .collect();
    let race = TrackedRace::new("stress", id, BoatClass::default(), competitors, course, RaceConfig::default());
    race.record_mark_fix(&"committee".into(), GpsFix::new(Position::new(0.0, 0.0), TimePoint::from_millis(0)));
    race.record_mark_fix(&"windward".into(), GpsFix::new(Position::new(0.02, 0.0), TimePoint::from_millis(0)));
    race
}

/// Helper: feed `fixes` fixes per boat from one thread per boat, while
/// `readers` threads query rankings. Returns the number of recorded fixes.
fn feed_and_query(race: &Arc<TrackedRace>, fixes: usize, readers: usize) -> usize {
    let ids = race.competitor_ids();
    for id in &ids {
        race.update_mark_passings(id, vec![MarkPassing::new(TimePoint::from_millis(0), "start".into(), id.clone())])
            .expect("known competitor");
    }

    let feeders: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(boat, id)| {
            let race = Arc::clone(race);
            let id = id.clone();
            thread::spawn(move || {
                let step = 0.0001 * (1.0 + boat as f64 * 0.02);
                let speed = SpeedWithBearing::new(
                    Speed::from_meters_per_second(step * 111_195.0),
                    Bearing::from_degrees(0.0),
                );
                let mut recorded = 0;
                for i in 0..fixes {
                    let fix = GpsFixMoving::new(
                        Position::new(i as f64 * step, 0.0),
                        TimePoint::from_seconds(i as f64),
                        speed,
                    );
                    if race.record_fix(&id, fix).expect("known competitor") {
                        recorded += 1;
                    }
                }
                recorded
            })
        })
        .collect();

    let query_readers: Vec<_> = (0..readers)
        .map(|r| {
            let race = Arc::clone(race);
            thread::spawn(move || {
                for i in 0..50 {
                    let at = TimePoint::from_seconds(((i * 7 + r) % fixes.max(1)) as f64);
                    let ranking = race.competitors_from_best_to_worst(at);
                    assert_eq!(ranking.len(), race.competitors().len());
                    let _ = race.wind(None, at);
                }
            })
        })
        .collect();

    let recorded = feeders
        .into_iter()
        .map(|h| h.join().expect("feeder panicked"))
        .sum();
    for handle in query_readers {
        handle.join().expect("reader panicked");
    }
    recorded
}

// ============================================================================
// Test: Small Fleet
// ============================================================================

#[test]
fn test_concurrent_fixes_and_rankings() {
    let _ = env_logger::builder().is_test(true).try_init();
    let race = Arc::new(fleet_race("small", 4));
    let before = race.update_count();

    let recorded = feed_and_query(&race, 60, 2);

    assert_eq!(recorded, 4 * 60);
    assert_eq!(race.stats().fix_count, 4 * 60);
    // One update per fix plus one per mark passing replacement
    assert_eq!(race.update_count(), before + 4 * 60 + 4);

    let at = TimePoint::from_seconds(59.0);
    race.flush_deferred_cache_clearing();
    let ranking = race.competitors_from_best_to_worst(at);
    // The fastest boat was fed with the largest step
    assert_eq!(ranking.first().map(|c| c.as_str()), Some("boat-3"));
}

#[test]
fn test_waiting_reader_sees_update_from_feeder() {
    let race = Arc::new(fleet_race("waiting", 1));
    let seen = race.update_count();

    let waiter = {
        let race = Arc::clone(&race);
        thread::spawn(move || race.wait_for_next_update(seen))
    };
    race.record_fix(
        &"boat-0".into(),
        GpsFixMoving::new(Position::new(0.0, 0.0), TimePoint::from_seconds(1.0), SpeedWithBearing::default()),
    )
    .expect("known competitor");

    assert!(waiter.join().expect("waiter panicked") > seen);
}

#[test]
fn test_registry_shares_races_across_threads() {
    with_registry(|registry| registry.add(fleet_race("shared", 2)));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let race = with_registry(|registry| registry.get("shared")).expect("registered race");
                race.record_fix(
                    &"boat-0".into(),
                    GpsFixMoving::new(
                        Position::new(0.0, 0.0),
                        TimePoint::from_seconds(i as f64),
                        SpeedWithBearing::default(),
                    ),
                )
                .expect("known competitor")
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let race = with_registry(|registry| registry.remove("shared")).expect("registered race");
    assert_eq!(race.competitor_track(&"boat-0".into()).expect("known").len(), 4);
}

// ============================================================================
// Test: Large Fleet
// ============================================================================

#[test]
#[ignore] // ~10s in debug, ~1s in release
fn test_large_fleet_throughput() {
    let race = Arc::new(fleet_race("large", 40));
    let start = Instant::now();
    let recorded = feed_and_query(&race, 600, 4);
    let elapsed = start.elapsed();

    println!("40 boats: {} fixes with concurrent rankings in {:?}", recorded, elapsed);
    assert_eq!(recorded, 40 * 600);
}
