use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on the exporter).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_ticks_total", "Scheduler ticks started.");
        describe_counter!(
            "ingest_ticks_skipped_total",
            "Ticks skipped because the rate budget was exhausted."
        );
        describe_counter!("ingest_fetched_total", "Mentions returned by the feed.");
        describe_counter!(
            "ingest_dedup_total",
            "Mentions dropped as already-seen source ids."
        );
        describe_counter!(
            "ingest_provider_errors_total",
            "Transient feed errors (asset skipped for the tick)."
        );
        describe_counter!(
            "ingest_rate_limited_total",
            "Out-of-band rate-limit responses from the feed."
        );
        describe_counter!("scoring_failures_total", "Individual scoring attempts that failed.");
        describe_counter!(
            "scoring_exhausted_total",
            "Mentions persisted without signals after exhausting retries."
        );
        describe_counter!(
            "store_persist_failures_total",
            "Ticks aborted by a persistence failure."
        );
        describe_counter!("trend_rebuilds_total", "Trend aggregates rebuilt from the store.");
        describe_histogram!("ingest_tick_ms", "Tick duration in milliseconds.");
        describe_histogram!("ingest_parse_ms", "Feed response parse time in milliseconds.");
        describe_gauge!("ingest_last_tick_ts", "Unix ts when the last tick finished.");
        describe_gauge!("rate_budget_remaining", "Feed calls left in the current window.");
    });
}

/// Install the Prometheus recorder with its own scrape listener.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("prometheus: install exporter: {e}"))?;
    ensure_described();
    Ok(())
}
