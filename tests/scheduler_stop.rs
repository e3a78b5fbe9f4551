// tests/scheduler_stop.rs
mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use common::{mention, page, test_config, ScriptedFeed};
use dugtrio_trends::analyze::{ScoringInput, ScoringPort};
use dugtrio_trends::error::ScoringError;
use dugtrio_trends::model::SignalDraft;
use dugtrio_trends::{
    Clock, IngestionScheduler, ManualClock, MemorySignalStore, SchedulerDeps, SignalKind,
    TickPhase,
};
use tokio::sync::{watch, Notify};

/// Blocks inside `score` until released, so a stop can land mid-tick.
#[derive(Default)]
struct GatedScorer {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ScoringPort for GatedScorer {
    async fn score(&self, _input: &ScoringInput) -> Result<Vec<SignalDraft>, ScoringError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(vec![SignalDraft::new(SignalKind::Sentiment, "positive", 0.6)])
    }

    fn version(&self) -> &str {
        "gated-1"
    }
}

fn build(
    clock: &ManualClock,
    feed: Arc<ScriptedFeed>,
    scorer: Arc<GatedScorer>,
    store: Arc<MemorySignalStore>,
) -> Arc<IngestionScheduler> {
    let cfg = test_config();
    let deps = SchedulerDeps::from_config(&cfg, Arc::new(clock.clone()), feed, scorer, store);
    Arc::new(IngestionScheduler::new(cfg, deps))
}

#[tokio::test]
async fn stop_mid_tick_lets_the_tick_finish() {
    let clock = ManualClock::at_epoch();
    let feed = Arc::new(ScriptedFeed::new());
    feed.push("SOL", Ok(page(vec![mention("s1", "SOL", "gm", clock.now())], Some("1"))));
    let scorer = Arc::new(GatedScorer::default());
    let store = Arc::new(MemorySignalStore::new());
    let s = build(&clock, feed.clone(), scorer.clone(), store.clone());

    let (tx, rx) = watch::channel(false);
    let runner = {
        let s = s.clone();
        tokio::spawn(async move { s.run(rx).await })
    };

    // First interval tick fires immediately; wait until scoring is underway.
    scorer.entered.notified().await;
    assert_eq!(s.phase(), TickPhase::Scoring);
    tx.send(true).unwrap();
    scorer.release.notify_one();

    tokio::time::timeout(StdDuration::from_secs(5), runner)
        .await
        .expect("runner stops")
        .unwrap();

    assert_eq!(store.mention_count(), 1);
    assert_eq!(store.signal_count(), 1);
    assert_eq!(s.phase(), TickPhase::Idle);
    assert_eq!(feed.call_count(), 1);
}

#[tokio::test]
async fn stop_before_start_runs_no_tick() {
    let clock = ManualClock::at_epoch();
    let feed = Arc::new(ScriptedFeed::new());
    let s = build(
        &clock,
        feed.clone(),
        Arc::new(GatedScorer::default()),
        Arc::new(MemorySignalStore::new()),
    );

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    s.run(rx).await;
    assert_eq!(feed.call_count(), 0);
}
