//! State that lives as long as the launcher process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::daemon::Daemon;
use crate::dl::ModuleLoader;
use crate::hook::{HookEngine, PatchBackend};
use crate::host::Host;
use crate::mount::NamespaceController;

static ZYGOTE: OnceLock<Zygote> = OnceLock::new();

/// Collaborators and cross-event state shared by every interception
/// context.
pub struct Zygote {
    daemon: Box<dyn Daemon>,
    loader: Box<dyn ModuleLoader>,
    host: Box<dyn Host>,
    hooks: HookEngine,
    namespace: Mutex<NamespaceController>,
    /// Set when the last application specialization kept modules loaded.
    spoof_maps: AtomicBool,
    fd_capacity: usize,
}

impl Zygote {
    pub fn new(
        daemon: Box<dyn Daemon>,
        loader: Box<dyn ModuleLoader>,
        host: Box<dyn Host>,
        backend: Box<dyn PatchBackend>,
        fd_capacity: usize,
    ) -> Self {
        Self {
            daemon,
            loader,
            host,
            hooks: HookEngine::new(backend),
            namespace: Mutex::new(NamespaceController::default()),
            spoof_maps: AtomicBool::new(false),
            fd_capacity,
        }
    }

    /// Install `self` as the process-wide instance. Hands it back if one
    /// was already installed.
    pub fn install(self) -> Result<(), Zygote> {
        ZYGOTE.set(self)
    }

    pub fn global() -> Option<&'static Zygote> {
        ZYGOTE.get()
    }

    pub fn daemon(&self) -> &dyn Daemon {
        self.daemon.as_ref()
    }

    pub fn loader(&self) -> &dyn ModuleLoader {
        self.loader.as_ref()
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn hooks(&self) -> &HookEngine {
        &self.hooks
    }

    pub fn namespace(&self) -> MutexGuard<'_, NamespaceController> {
        self.namespace.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn should_spoof_maps(&self) -> bool {
        self.spoof_maps.load(Ordering::SeqCst)
    }

    pub(crate) fn set_spoof_maps(&self, value: bool) {
        self.spoof_maps.store(value, Ordering::SeqCst);
    }

    pub fn fd_capacity(&self) -> usize {
        self.fd_capacity
    }
}
