use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `IMGSTREAM_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for imgstream pipelines:
/// - Pipeline events use target `imgstream_pipeline` and carry an `event` field.
/// - Include `partition` on any resolve-related event.
/// - Include `original_id` (and `url` when known) on per-item failures.
/// - Metric snapshots use target `imgstream_metrics`.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Same as [`init_tracing`] but tolerates an already-installed subscriber (tests, embedders).
pub fn try_init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init()
        .is_ok()
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("IMGSTREAM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
