// tests/ingest_dedup.rs
use std::sync::Arc;

use chrono::Duration;
use dugtrio_trends::ingest::dedup::DedupRecord;
use dugtrio_trends::{Clock, Deduplicator, ManualClock, SystemClock};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_admit_of_same_id_has_exactly_one_winner() {
    const N: usize = 64;
    let dedup = Arc::new(Deduplicator::new(Arc::new(SystemClock), Duration::hours(1)));
    let barrier = Arc::new(tokio::sync::Barrier::new(N));

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let dedup = dedup.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                dedup.admit("a1")
            })
        })
        .collect();

    let mut wins = 0;
    for h in handles {
        if h.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

#[test]
fn racing_threads_admit_each_id_once() {
    let dedup = Arc::new(Deduplicator::new(Arc::new(SystemClock), Duration::hours(1)));
    let ids: Vec<String> = (0..500).map(|i| format!("tw{i}")).collect();

    let wins: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                let ids = &ids;
                scope.spawn(move || ids.iter().filter(|id| dedup.admit(id)).count())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(wins, ids.len());
    assert_eq!(dedup.len(), ids.len());
}

#[test]
fn warmed_ids_are_duplicates_until_retention_passes() {
    let clock = ManualClock::at_epoch();
    let dedup = Deduplicator::new(Arc::new(clock.clone()), Duration::hours(24));
    dedup.warm(vec![DedupRecord {
        source_id: "old".into(),
        first_seen_at: clock.now() - Duration::hours(20),
    }]);

    assert!(!dedup.admit("old"));

    // 20h + 7h puts the record past the 24h window and a sweep is due.
    clock.advance(Duration::hours(7));
    assert!(dedup.admit("new"));
    assert!(!dedup.contains("old"));
    assert!(dedup.admit("old"));
}
