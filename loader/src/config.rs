//! Loader configuration resolved once at init.

use std::path::PathBuf;

use log::LevelFilter;
use zygisk_protocol::platform;

/// Hard ceiling on the descriptor allow-list capacity.
pub const MAX_FDS_CEILING: usize = 65536;

const DEFAULT_MAX_FDS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Unix socket the daemon listens on.
    pub socket_path: PathBuf,
    pub log_level: LevelFilter,
    /// Requested allow-list capacity before the `RLIMIT_NOFILE` bound.
    pub max_fds: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(platform::default_socket_path()),
            log_level: if cfg!(debug_assertions) { LevelFilter::Trace } else { LevelFilter::Info },
            max_fds: DEFAULT_MAX_FDS,
        }
    }
}

impl LoaderConfig {
    /// Read `ZYGISK_SOCKET`, `ZYGISK_LOG` and `ZYGISK_MAX_FDS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("ZYGISK_SOCKET").filter(|p| !p.is_empty()) {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("ZYGISK_LOG").and_then(|l| l.parse().ok()) {
            config.log_level = level;
        }
        if let Some(max) = lookup("ZYGISK_MAX_FDS").and_then(|v| v.trim().parse::<usize>().ok()) {
            config.max_fds = max.clamp(1, MAX_FDS_CEILING);
        }
        config
    }

    /// Allow-list capacity bounded by the soft descriptor limit.
    pub fn fd_capacity(&self, rlimit: usize) -> usize {
        self.max_fds.min(rlimit.max(1))
    }
}
