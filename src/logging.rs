use log::info;

/// Installs the global logger. `RUST_LOG` wins over `default_level`.
/// Repeat calls are ignored, so tests and embedders can call it freely.
pub fn initialize_logger(default_level: &str) {
    let initialized = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .format_timestamp_secs()
    .format_module_path(true)
    .try_init()
    .is_ok();

    if initialized {
        info!("Logger initialized");
    }
}
