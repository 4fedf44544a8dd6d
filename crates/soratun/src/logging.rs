//! Logger setup for the binaries.

use env_logger::Env;

/// Default filter for a config `logLevel`: 0 silent, 1 errors, 2 and above
/// debug output from the tunnel and clients.
pub fn default_filter(log_level: u8) -> &'static str {
    match log_level {
        0 => "off",
        1 => "error",
        _ => "warn,arc_netstack=debug,arc_client=debug,soratun=debug,soraproxy=debug",
    }
}

/// Initialise `env_logger`. `RUST_LOG` overrides the config level.
pub fn init(log_level: u8) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter(log_level)))
        .format_timestamp_millis()
        .try_init();
}
