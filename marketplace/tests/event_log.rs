//! Event log merge-safety and replay properties.
//!
//! Two writers appending to separate copies of the log and then merging
//! their files must project the same state as a single writer that saw every
//! event, and concurrent appends to one directory must never lose a record.

use std::fs;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use marketplace::core::invariants::check_state_invariants;
use marketplace::core::projector::{ProjectionConfig, project};
use marketplace::core::types::{Event, OutcomeKind};
use marketplace::core::weights::WeightConstraints;
use marketplace::io::event_store::EventStore;
use marketplace::test_support::event_at;

fn config() -> ProjectionConfig {
    ProjectionConfig {
        num_bots: 3,
        base_budget_per_bot: 10,
        weight_constraints: WeightConstraints::default(),
    }
}

fn random_events(rng: &mut StdRng, count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            let kind = OutcomeKind::ALL[rng.gen_range(0..OutcomeKind::ALL.len())];
            let bot = format!("bidder_{}", rng.gen_range(1..=3));
            event_at(i as i64, &bot, kind)
        })
        .collect()
}

#[test]
fn merged_logs_project_like_a_single_writer() {
    let mut rng = StdRng::seed_from_u64(7);
    let events = random_events(&mut rng, 40);

    let left = tempfile::tempdir().expect("left");
    let right = tempfile::tempdir().expect("right");
    let merged = tempfile::tempdir().expect("merged");
    let left_store = EventStore::new(left.path());
    let right_store = EventStore::new(right.path());
    for (idx, event) in events.iter().enumerate() {
        let store = if idx % 2 == 0 { &left_store } else { &right_store };
        store.append(event).expect("append");
    }

    for dir in [left.path(), right.path()] {
        for entry in fs::read_dir(dir).expect("read dir") {
            let entry = entry.expect("entry");
            fs::copy(entry.path(), merged.path().join(entry.file_name())).expect("copy");
        }
    }

    let loaded = EventStore::new(merged.path()).load_all().expect("load");
    assert_eq!(loaded.events.len(), events.len());
    assert!(loaded.warnings.is_empty());
    let from_merge = project(&loaded.events, &config()).expect("merged projection");
    let from_memory = project(&events, &config()).expect("memory projection");
    assert_eq!(from_merge.state, from_memory.state);
}

#[test]
fn concurrent_appends_keep_every_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(EventStore::new(dir.path()));
    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..5 {
                    // Same timestamp and author on purpose: names collide.
                    let event = event_at(writer, "bidder_1", OutcomeKind::RankedNotTried);
                    store.append(&event).expect("append");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer");
    }

    let loaded = store.load_all().expect("load");
    assert_eq!(loaded.events.len(), 20);
}

#[test]
fn shuffled_replay_keeps_invariants_and_state() {
    let mut rng = StdRng::seed_from_u64(0xfeed);
    for _ in 0..20 {
        let count = rng.gen_range(0..60);
        let events = random_events(&mut rng, count);
        let expected = project(&events, &config()).expect("projection");

        let mut shuffled = events.clone();
        shuffled.shuffle(&mut rng);
        let replayed = project(&shuffled, &config()).expect("shuffled projection");
        assert_eq!(replayed.state, expected.state);
        assert_eq!(replayed.staleness_token, count);

        let errors = check_state_invariants(
            &replayed.state,
            config().total_budget_pool(),
            &config().weight_constraints,
        );
        assert!(errors.is_empty(), "{errors:?}");
    }
}
