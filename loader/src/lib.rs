//! zygisk loader - injected into the zygote to host zygisk modules.
//!
//! This library is compiled as a cdylib and loaded into the launcher
//! process. `zygisk_loader_init` wires the daemon client, module loader and
//! hook engine together; the `zygisk_*` specialization exports are then
//! called around the launcher's native fork and specialize methods.

pub mod api;
pub mod config;
pub mod context;
pub mod daemon;
pub mod dl;
pub mod entry;
pub mod fds;
pub mod hook;
pub mod host;
pub mod jni;
pub mod module;
pub mod mount;
pub mod zygote;

#[cfg(test)]
mod tests;

pub use config::LoaderConfig;
pub use context::{Context, EventFlags};
pub use entry::{fork_and_specialize, fork_system_server, specialize_app_process};
pub use zygote::Zygote;

use anyhow::{Context as _, Result};
use log::{debug, error, info, warn, LevelFilter};

use crate::api::ZYGISK_API_VERSION;
use crate::daemon::DaemonClient;
use crate::dl::DlLoader;
use crate::hook::PltBackend;
use crate::host::{Host, LinuxHost};

fn init_logging(level: LevelFilter) {
    #[cfg(target_os = "android")]
    android_logger::init_once(android_logger::Config::default().with_max_level(level).with_tag("zygisk"));

    #[cfg(not(target_os = "android"))]
    {
        let _ = env_logger::Builder::from_default_env().filter_level(level).try_init();
    }
}

/// Build the launcher-lifetime state and install the fork hook.
pub fn init(config: &LoaderConfig) -> Result<()> {
    let daemon = DaemonClient::new(&config.socket_path);
    if let Err(e) = daemon.ping() {
        warn!("daemon not reachable yet: {e:#}");
    }

    let host = LinuxHost;
    let capacity = config.fd_capacity(host.fd_limit());
    let zygote = Zygote::new(Box::new(daemon), Box::new(DlLoader), Box::new(host), Box::new(PltBackend), capacity);
    if zygote.install().is_err() {
        debug!("loader already initialized");
        return Ok(());
    }
    let zygote = Zygote::global().context("loader state missing after install")?;

    if !entry::install_fork_hook(zygote) {
        warn!("fork hook not installed");
    }
    info!("zygisk loader ready (module API {ZYGISK_API_VERSION}, {capacity} fd slots)");
    Ok(())
}

/// C entry point called once after injection.
///
/// Returns 0 on success, -1 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn zygisk_loader_init() -> i32 {
    let config = LoaderConfig::from_env();
    init_logging(config.log_level);
    match init(&config) {
        Ok(()) => 0,
        Err(e) => {
            error!("zygisk loader init failed: {e:#}");
            -1
        }
    }
}
