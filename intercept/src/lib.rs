//! zygisk-intercept: memory-map snapshots and batched GOT/PLT patching for
//! the zygisk loader.

pub mod code;
pub mod maps;
pub mod module;
pub mod plt;
pub mod types;

pub use maps::MapInfo;
pub use types::{FileId, HookError};

/// Process-global lock for tests that rewrite relocation slots of the
/// running test executable.
///
/// All tests that patch GOT entries must hold this lock to prevent one test
/// from observing another's replacement.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
