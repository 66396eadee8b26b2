use log::LevelFilter;

/// Initialise `env_logger` with an `Info` default that `RUST_LOG` can override.
pub fn setup_logger() {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}
