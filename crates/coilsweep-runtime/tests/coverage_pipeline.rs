//! End-to-end: transform tree → pose sampler → coverage loop → event bus.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use coilsweep_middleware::{Bridge, EventBus, Topic, TopicReceiver};
use coilsweep_perception::{
    CoverageGrid, DetectionFootprint, PoseSampler, Quaternion, TfEngine, TfPoseSource,
    Transform3D, Vec3,
};
use coilsweep_runtime::{BusPublisher, CoverageLoop, CoverageLoopConfig, spawn_transform_listener};
use coilsweep_types::{CellState, EventPayload, GridSnapshot};

const FIELD: &str = "minefield";

struct Rig {
    bus: EventBus,
    tf: Arc<RwLock<TfEngine>>,
    driver: CoverageLoop,
    grids: TopicReceiver,
    rates: TopicReceiver,
}

fn rig(coils: &[&str], cell_radius: i64) -> Rig {
    let tf = Arc::new(RwLock::new(TfEngine::new()));
    let bus = EventBus::default();
    let grids = bus.subscribe_to(Topic::OccupancyGrid);
    let rates = bus.subscribe_to(Topic::CoverageRate);

    let sampler = PoseSampler::new(
        FIELD,
        coils.iter().copied(),
        Box::new(TfPoseSource::new(Arc::clone(&tf), Duration::from_millis(500))),
    )
    .expect("valid sensor set")
    .with_failure_backoff(Duration::ZERO);

    let driver = CoverageLoop::new(
        CoverageGrid::new(1.0, 10, 10).expect("valid grid"),
        sampler,
        DetectionFootprint::from_cells(cell_radius),
        Box::new(BusPublisher::new(bus.clone())),
        CoverageLoopConfig::default(),
    )
    .expect("valid loop config");

    Rig {
        bus,
        tf,
        driver,
        grids,
        rates,
    }
}

fn place(tf: &Arc<RwLock<TfEngine>>, coil: &str, x: f64, y: f64) {
    tf.write().expect("tf lock").set_transform(
        FIELD,
        coil,
        Transform3D::new(Vec3::new(x, y, 0.35), Quaternion::identity()),
    );
}

/// Cells a stamp at cell `(cx, cy)` covers on a 10×10 grid.
fn footprint(cx: i64, cy: i64, r: i64) -> BTreeSet<(u32, u32)> {
    let mut cells = BTreeSet::new();
    for dx in -r..r {
        for dy in -r..r {
            let (x, y) = (cx + dx, cy + dy);
            if (0..10).contains(&x) && (0..10).contains(&y) && dx * dx + dy * dy <= r * r {
                cells.insert((x as u32, y as u32));
            }
        }
    }
    cells
}

fn covered(snapshot: &GridSnapshot) -> BTreeSet<(u32, u32)> {
    let mut cells = BTreeSet::new();
    for y in 0..snapshot.height {
        for x in 0..snapshot.width {
            if snapshot.value_at(x, y) == Some(CellState::COVERED_VALUE) {
                cells.insert((x, y));
            }
        }
    }
    cells
}

async fn next_grid(rx: &mut TopicReceiver) -> GridSnapshot {
    match rx.recv().await.expect("grid published").payload {
        EventPayload::OccupancyGrid(grid) => grid,
        other => panic!("unexpected payload: {other:?}"),
    }
}

async fn next_rate(rx: &mut TopicReceiver) -> f32 {
    match rx.recv().await.expect("rate published").payload {
        EventPayload::CoverageRate(rate) => rate,
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn moving_coil_covers_union_of_two_footprints() {
    let mut rig = rig(&["middle_coil"], 1);

    place(&rig.tf, "middle_coil", 0.0, 0.0);
    rig.driver.tick().await;
    let first = next_grid(&mut rig.grids).await;
    assert_eq!(covered(&first), footprint(5, 5, 1));

    place(&rig.tf, "middle_coil", 1.0, 0.0);
    rig.driver.tick().await;
    let second = next_grid(&mut rig.grids).await;

    let expected: BTreeSet<_> = footprint(5, 5, 1)
        .union(&footprint(6, 5, 1))
        .copied()
        .collect();
    assert_eq!(covered(&second), expected);
    assert_eq!(expected.len(), 5);
    assert_eq!(rig.driver.grid().covered_count(), 5);

    assert!((next_rate(&mut rig.rates).await - 0.03).abs() < 1e-6);
    assert!((next_rate(&mut rig.rates).await - 0.05).abs() < 1e-6);
}

#[tokio::test]
async fn failing_coil_contributes_nothing_until_it_recovers() {
    let mut rig = rig(&["left_coil", "right_coil"], 1);
    place(&rig.tf, "left_coil", -3.0, 0.0);

    // right_coil has never been broadcast: several cycles, no error, only
    // left_coil's footprint.
    for _ in 0..4 {
        let report = rig.driver.tick().await;
        assert_eq!(report.skipped, 1);
        place(&rig.tf, "left_coil", -3.0, 0.0);
    }
    assert_eq!(rig.driver.grid().covered_count(), footprint(2, 5, 1).len());
    for _ in 0..4 {
        let grid = next_grid(&mut rig.grids).await;
        assert_eq!(covered(&grid), footprint(2, 5, 1));
    }

    place(&rig.tf, "right_coil", 3.0, 0.0);
    let report = rig.driver.tick().await;
    assert_eq!(report.skipped, 0);
    assert_eq!(report.newly_covered, footprint(8, 5, 1).len());

    let expected: BTreeSet<_> = footprint(2, 5, 1)
        .union(&footprint(8, 5, 1))
        .copied()
        .collect();
    let mut latest = next_grid(&mut rig.grids).await;
    while let Ok(event) = rig.grids.try_recv() {
        if let EventPayload::OccupancyGrid(grid) = event.payload {
            latest = grid;
        }
    }
    assert_eq!(covered(&latest), expected);
}

#[tokio::test]
async fn stale_coil_is_skipped_without_losing_coverage() {
    let mut rig = rig(&["middle_coil"], 2);
    place(&rig.tf, "middle_coil", 0.0, 0.0);
    rig.driver.tick().await;
    let before = rig.driver.grid().covered_count();
    assert!(before > 0);

    let old = Instant::now()
        .checked_sub(Duration::from_secs(5))
        .expect("monotonic clock has history");
    rig.tf.write().expect("tf lock").set_transform_at(
        FIELD,
        "middle_coil",
        Transform3D::new(Vec3::new(3.0, 3.0, 0.0), Quaternion::identity()),
        old,
    );
    let report = rig.driver.tick().await;
    assert_eq!(report.sampled, 0);
    assert_eq!(report.newly_covered, 0);
    assert_eq!(rig.driver.grid().covered_count(), before);
}

#[tokio::test]
async fn coverage_ratio_is_monotonic_over_a_sweep() {
    let mut rig = rig(&["left_coil", "middle_coil", "right_coil"], 2);
    let mut previous = 0.0;
    for step in 0..20 {
        let x = -5.0 + f64::from(step) * 0.5;
        place(&rig.tf, "left_coil", x, 2.0);
        place(&rig.tf, "middle_coil", x, 0.0);
        place(&rig.tf, "right_coil", x, -2.0);
        let report = rig.driver.tick().await;
        assert!(report.coverage_ratio >= previous);
        assert!(report.coverage_ratio <= 1.0);
        previous = report.coverage_ratio;
    }
    assert_eq!(
        rig.driver.grid().covered_count(),
        rig.driver.grid().recount_covered()
    );
}

#[tokio::test]
async fn pose_ingested_through_the_bridge_is_stamped() {
    let mut rig = rig(&["left_coil"], 1);
    let _listener = spawn_transform_listener(&rig.bus, Arc::clone(&rig.tf));
    let bridge = Bridge::new(rig.bus.clone());

    bridge
        .ingest_transform(FIELD, "left_coil", [-3.0, 0.0, 0.35], 0.0)
        .expect("listener subscribed");
    for _ in 0..200 {
        if rig.tf.read().expect("tf lock").has_frame("left_coil") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = rig.driver.tick().await;
    assert_eq!(report.sampled, 1);
    assert_eq!(report.newly_covered, footprint(2, 5, 1).len());
    assert_eq!(covered(&next_grid(&mut rig.grids).await), footprint(2, 5, 1));
}
