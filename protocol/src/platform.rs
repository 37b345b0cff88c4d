//! Platform-specific constants.
//!
//! Centralizes pointer-width dependent values to avoid scattered #[cfg] blocks.

/// Directory the daemon serves its sockets from.
pub const DAEMON_DIR: &str = "/data/adb/zygisk";

/// Socket name matching the ABI of the calling process.
pub const SOCKET_NAME: &str = if cfg!(target_pointer_width = "64") { "cp64.sock" } else { "cp32.sock" };

/// Default daemon socket path for the current ABI.
pub fn default_socket_path() -> String {
    format!("{DAEMON_DIR}/{SOCKET_NAME}")
}

/// Upper bound accepted for length-prefixed payloads.
pub const MAX_FRAME_LEN: usize = 1 << 20;
