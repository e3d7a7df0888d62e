//! Central place for application-wide constants and default values.

use std::time::Duration;

/// Application name used in logs and the CLI banner.
pub const DEFAULT_APP_NAME: &str = "corebot";

/// Left padding used to align console lines.
pub const ICON_PLACEHOLDER: &str = "   "; // Three spaces for alignment

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "corebot.ini";

/// Directory searched for dynamically loadable module units.
pub const DEFAULT_MODULE_DIR: &str = "modules";

/// Global config key holding the comma separated module list.
pub const MODULES_KEY: &str = "modules";

/// Upper bound on a single readiness wait, so ticks keep advancing without I/O.
pub const WAIT_CEILING: Duration = Duration::from_secs(1);

/// Message delimiter on the stream transport.
pub const LINE_DELIMITER: &[u8] = b"\r\n";

/// Framer capacity in bytes unless `[server] buffer` overrides it.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Seconds between connection attempts unless `[server] backoff` overrides it.
pub const DEFAULT_BACKOFF_SECS: u64 = 10;

/// Seconds one attempt may spend resolving and connecting unless `[server] connect_timeout` overrides it.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Version of the C ABI table handed to dynamic units.
pub const HOST_ABI_VERSION: u32 = 1;

/// Process exit code after a cooperative shutdown.
pub const EXIT_OK: i32 = 0;

/// Process exit code when no module list could be determined at startup.
pub const EXIT_NO_MODULES: i32 = 1;

/// Application / crate version (populated from Cargo.toml via env! macro)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Platform extension of dynamic units: .so (Linux), .dylib (macOS), .dll (Windows).
pub fn dylib_extension() -> &'static str {
    std::env::consts::DLL_EXTENSION
}
