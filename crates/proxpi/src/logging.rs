use proxpi_service::Config;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Initializes the global tracing subscriber from the configured logging
/// threshold (`PROXPI_LOGGING_LEVEL`). The value is an env-filter
/// directive, so plain levels (`info`) and per-target filters
/// (`proxpi=debug,hyper=warn`) both work.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_new(&config.logging_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}
