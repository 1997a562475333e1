use log::LevelFilter;

/// Debug in development builds and Info in release builds.
pub fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs the stdout logger. `RUST_LOG` overrides the default level.
/// Calling it twice is harmless.
pub fn init() {
    let _ = env_logger::builder()
        .filter_level(default_level())
        .format_timestamp_millis()
        .parse_default_env()
        .try_init();
}
