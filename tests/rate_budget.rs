// tests/rate_budget.rs
mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{scheduler, test_config, FlakyScorer, ScriptedFeed};
use dugtrio_trends::{Clock, ManualClock, MemorySignalStore, RateBudget, SignalStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn single_call_budget_refuses_second_call_in_window() {
    let clock = ManualClock::at_epoch();
    let budget = RateBudget::new(Arc::new(clock.clone()), 1, Duration::minutes(15));
    assert!(budget.try_consume(1));
    assert!(!budget.try_consume(1));
    assert_eq!(budget.remaining(), 0);
}

#[test]
fn calls_used_never_exceeds_allowance_under_random_timing() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for allowed in [1u32, 3, 10] {
        let clock = ManualClock::at_epoch();
        let budget = RateBudget::new(Arc::new(clock.clone()), allowed, Duration::minutes(15));

        for _ in 0..2_000 {
            clock.advance(Duration::seconds(rng.random_range(0..120)));
            if rng.random_bool(0.02) {
                let reset = clock.now() + Duration::seconds(rng.random_range(0..600));
                budget.exhaust(Some(reset));
            }

            let before = budget.snapshot();
            let n = rng.random_range(0..=3u32);
            let ok = budget.try_consume(n);
            let after = budget.snapshot();

            assert!(after.calls_used <= after.calls_allowed);
            if ok && after.window_start == before.window_start {
                assert_eq!(after.calls_used, before.calls_used + n);
            }
            if !ok {
                assert_eq!(after, before);
            }
        }
    }
}

#[tokio::test]
async fn scheduler_never_fetches_past_the_budget() {
    let clock = ManualClock::at_epoch();
    let now = clock.now();
    let store = Arc::new(MemorySignalStore::new());
    for a in ["BONK", "JUP", "SOL", "WIF"] {
        store.track_asset(a, now).await.unwrap();
    }
    let feed = Arc::new(ScriptedFeed::new());
    let cfg = dugtrio_trends::config::PipelineConfig {
        rate_limit_calls: 3,
        rate_limit_window_secs: 600,
        ..test_config()
    };
    let s = scheduler(cfg, &clock, feed.clone(), Arc::new(FlakyScorer::new()), store);

    let mut rng = StdRng::seed_from_u64(7);
    let mut window_start = None;
    let mut used_in_window = 0usize;

    for _ in 0..200 {
        clock.advance(Duration::seconds(rng.random_range(0..400)));
        let before = feed.call_count();
        s.tick().await.unwrap();
        let made = feed.call_count() - before;

        let snap = s.deps().budget.snapshot();
        if window_start != Some(snap.window_start) {
            window_start = Some(snap.window_start);
            used_in_window = 0;
        }
        used_in_window += made;
        assert!(used_in_window <= 3, "fetched {used_in_window} times in one window");
        assert_eq!(snap.calls_used as usize, used_in_window);
    }
}
