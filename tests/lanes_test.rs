mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{Fragile, Recorder, VisitLog};
use lane_pipeline::collection::Document;
use lane_pipeline::condition::RunCondition;
use lane_pipeline::error::PipelineError;
use lane_pipeline::lanes::{Lane, LanePool, StageSetDuplicator};
use lane_pipeline::stage::StageSlot;
use lane_pipeline::types::RunMode;

fn recorder_lane(names: &[&str], log: &VisitLog) -> Lane<Document> {
    let mut lane = Lane::new();
    for name in names {
        lane.push(StageSlot::new(Recorder::new(name, log).boxed()));
    }
    lane
}

// --- StageSetDuplicator::build ---

#[test]
fn duplicating_k_times_yields_k_independent_instances() {
    let log = VisitLog::default();
    let canonical = recorder_lane(&["a", "b"], &log);

    let duplicates = StageSetDuplicator::build(&canonical, 4).unwrap();
    assert_eq!(duplicates.len(), 3);

    let mut ids: HashSet<_> = canonical.stage_ids().into_iter().collect();
    let mut lane_ids: HashSet<_> = HashSet::from([canonical.id()]);
    for lane in &duplicates {
        assert_eq!(lane.len(), 2);
        assert!(lane_ids.insert(lane.id()), "lane ids must be unique");
        for id in lane.stage_ids() {
            assert!(ids.insert(id), "stage instance {} shared between lanes", id);
        }
    }
    assert_eq!(ids.len(), 8);
}

#[test]
fn lanes_without_conditions_duplicate_without_conditions() {
    let log = VisitLog::default();
    let canonical = recorder_lane(&["a"], &log);

    let duplicates = StageSetDuplicator::build(&canonical, 2).unwrap();

    assert!(!canonical.has_conditions());
    assert!(!duplicates[0].has_conditions());
}

#[test]
fn and_always_not_never_duplicates_into_three_true_instances() {
    let log = VisitLog::default();
    let mut canonical = recorder_lane(&["a"], &log);
    canonical.set_condition(
        0,
        Some(RunCondition::and(vec![
            RunCondition::Always,
            RunCondition::not(RunCondition::Never),
        ])),
    );

    let duplicates = StageSetDuplicator::build(&canonical, 3).unwrap();

    let conditions: Vec<&RunCondition<Document>> = std::iter::once(&canonical)
        .chain(duplicates.iter())
        .map(|lane| lane.condition(0).unwrap())
        .collect();
    assert_eq!(conditions.len(), 3);
    for condition in conditions {
        assert!(condition.should_run());
        assert_eq!(condition.run_mode(), RunMode::Conditional);
        assert_eq!(condition.to_string(), "and(always, not(never))");
    }
}

#[test]
fn leaf_conditions_follow_their_lane() {
    let log = VisitLog::default();
    let mut canonical = recorder_lane(&["a", "b"], &log);
    let binding = canonical.binding(1).unwrap().clone();
    canonical.set_condition(
        1,
        Some(RunCondition::not(RunCondition::when(&binding, "named a", |d: &Document| {
            d.name() == "a"
        }))),
    );

    let duplicates = StageSetDuplicator::build(&canonical, 3).unwrap();

    for lane in std::iter::once(&canonical).chain(duplicates.iter()) {
        let condition = lane.condition(1).unwrap();
        assert_eq!(condition.stage_id(), Some(lane.stage_ids()[1]));
        // Nothing is bound outside an episode, so the leaf is false and NOT is true.
        assert!(condition.should_run());
        assert!(lane.condition(0).is_none());
    }
}

#[test]
fn failed_duplication_cleans_up_finished_copies() {
    let fragile = Fragile::new(2);
    let mut canonical: Lane<Document> = Lane::new();
    canonical.push(StageSlot::new(fragile.boxed()));

    let err = StageSetDuplicator::build(&canonical, 4).unwrap_err();

    assert!(matches!(err, PipelineError::StageDuplication { stage_index: 0, .. }));
    assert_eq!(fragile.duplicates(), 2);
    assert_eq!(fragile.cleanups(), 2);
    assert_eq!(canonical.len(), 1);
}

// --- StageSetDuplicator::teardown ---

#[test]
fn teardown_returns_canonical_from_any_position() {
    let log = VisitLog::default();
    let canonical = recorder_lane(&["a"], &log);
    let canonical_id = canonical.id();
    let canonical_stage = canonical.stage_ids()[0];
    let mut lanes = StageSetDuplicator::build(&canonical, 3).unwrap();
    lanes.push(canonical);

    let kept = StageSetDuplicator::teardown(lanes, canonical_id).unwrap();

    assert_eq!(kept.id(), canonical_id);
    assert_eq!(kept.stage_ids(), vec![canonical_stage]);
}

#[test]
fn teardown_without_canonical_releases_everything() {
    let fragile = Fragile::new(10);
    let mut canonical: Lane<Document> = Lane::new();
    canonical.push(StageSlot::new(fragile.boxed()));
    let duplicates = StageSetDuplicator::build(&canonical, 3).unwrap();

    assert!(StageSetDuplicator::teardown(duplicates, canonical.id()).is_none());
    assert_eq!(fragile.cleanups(), 2);
}

// --- LanePool ---

#[test]
fn pool_never_hands_out_more_lanes_than_it_holds() {
    let log = VisitLog::default();
    let lanes = (0..3).map(|_| recorder_lane(&["a"], &log)).collect();
    let pool = Arc::new(LanePool::new(lanes));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            std::thread::spawn(move || {
                let cancel = CancellationToken::new();
                for _ in 0..5 {
                    let lease = pool.checkout(&cancel).unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(lease);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.available(), 3);
    assert_eq!(pool.checked_out(), 0);
    assert_eq!(pool.drain().len(), 3);
}

#[test]
fn waiting_checkout_wakes_when_a_lane_returns() {
    let log = VisitLog::default();
    let pool = Arc::new(LanePool::new(vec![recorder_lane(&["a"], &log)]));
    let cancel = CancellationToken::new();
    let held = pool.checkout(&cancel).unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || pool.checkout(&CancellationToken::new()).map(|l| l.id()))
    };
    std::thread::sleep(Duration::from_millis(20));
    drop(held);

    assert_eq!(waiter.join().unwrap().unwrap(), held_id);
}
