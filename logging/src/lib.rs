//! Process-wide logging initialization: a thin wrapper around `env_logger`
//! so `hub_server` (and any test binary that wants real output) has one
//! place to call.

/// Initializes the global logger from `RUST_LOG`, defaulting to `info` when
/// unset. Safe to call once per process; a second call is a no-op logged at
/// `warn`.
pub fn init() {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if builder.try_init().is_err() {
        log::warn!("logger already initialized; ignoring redundant init() call");
    }
}
