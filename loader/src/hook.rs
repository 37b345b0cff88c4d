//! Hook engine front-end.
//!
//! Modules queue path-pattern hook and exclusion requests; `commit` resolves
//! them against the cached memory map into device/inode requests for the
//! patch backend, then applies the batch.

use core::ffi::c_void;
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use regex::Regex;
use zygisk_intercept::MapInfo;

/// The low-level patch primitive the engine drives.
pub trait PatchBackend: Send + Sync {
    /// Queue one relocation rewrite for the image with this identity.
    fn register(&self, dev: u64, inode: u64, symbol: &str, replacement: *mut c_void, backup: *mut *mut c_void) -> bool;

    /// Apply everything queued against `maps`.
    fn commit(&self, maps: &[MapInfo]) -> bool;

    /// Undo every rewrite ever applied. Returns the number of slots restored.
    fn revert_all(&self, maps: &[MapInfo]) -> usize;

    /// Fresh memory-map snapshot.
    fn snapshot(&self) -> Vec<MapInfo>;
}

/// [`PatchBackend`] over the process-global PLT batch.
#[derive(Debug, Default)]
pub struct PltBackend;

impl PatchBackend for PltBackend {
    fn register(&self, dev: u64, inode: u64, symbol: &str, replacement: *mut c_void, backup: *mut *mut c_void) -> bool {
        zygisk_intercept::plt::register_hook(dev, inode, symbol, replacement, backup)
    }

    fn commit(&self, maps: &[MapInfo]) -> bool {
        zygisk_intercept::plt::commit_hook(maps)
    }

    fn revert_all(&self, maps: &[MapInfo]) -> usize {
        zygisk_intercept::plt::revert_all(maps)
    }

    fn snapshot(&self) -> Vec<MapInfo> {
        MapInfo::scan_self()
    }
}

struct RegisterRequest {
    pattern: Regex,
    symbol: String,
    replacement: usize,
    backup: usize,
}

struct ExcludeRequest {
    pattern: Regex,
    /// Empty excludes every symbol of matching images.
    symbol: String,
}

#[derive(Default)]
struct Pending {
    register: Vec<RegisterRequest>,
    exclude: Vec<ExcludeRequest>,
}

pub struct HookEngine {
    backend: Box<dyn PatchBackend>,
    pending: Mutex<Pending>,
    maps: Mutex<Vec<MapInfo>>,
}

impl HookEngine {
    pub fn new(backend: Box<dyn PatchBackend>) -> Self {
        let maps = backend.snapshot();
        Self { backend, pending: Mutex::new(Pending::default()), maps: Mutex::new(maps) }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a hook of `symbol` in every image whose path matches `pattern`.
    ///
    /// Patterns that fail to compile are dropped with a warning.
    pub fn register(&self, pattern: &str, symbol: &str, replacement: *mut c_void, backup: *mut *mut c_void) -> bool {
        if symbol.is_empty() || replacement.is_null() {
            return false;
        }
        let pattern = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!("dropping hook of {symbol}: bad pattern {pattern:?}: {e}");
                return false;
            }
        };
        self.pending().register.push(RegisterRequest {
            pattern,
            symbol: symbol.to_string(),
            replacement: replacement as usize,
            backup: backup as usize,
        });
        true
    }

    /// Exclude images matching `pattern` from pending hooks of `symbol`, or
    /// of every symbol when `symbol` is `None`.
    pub fn exclude(&self, pattern: &str, symbol: Option<&str>) -> bool {
        let pattern = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!("dropping exclusion: bad pattern {pattern:?}: {e}");
                return false;
            }
        };
        self.pending().exclude.push(ExcludeRequest { pattern, symbol: symbol.unwrap_or_default().to_string() });
        true
    }

    /// Queue a hook directly by file identity.
    pub fn register_by_id(&self, dev: u64, inode: u64, symbol: &str, replacement: *mut c_void, backup: *mut *mut c_void) -> bool {
        if dev == 0 || inode == 0 || symbol.is_empty() || replacement.is_null() {
            return false;
        }
        self.backend.register(dev, inode, symbol, replacement, backup)
    }

    /// Resolve and apply every queued request.
    ///
    /// Both pending lists are empty afterwards, whether or not anything
    /// matched.
    pub fn commit(&self) -> bool {
        self.refresh_maps();
        {
            let mut pending = self.pending();
            let maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
            for map in maps.iter().filter(|m| m.is_image_base() && !m.path.is_empty()) {
                for req in &pending.register {
                    if !req.pattern.is_match(&map.path) {
                        continue;
                    }
                    let excluded = pending
                        .exclude
                        .iter()
                        .any(|ex| (ex.symbol.is_empty() || ex.symbol == req.symbol) && ex.pattern.is_match(&map.path));
                    if excluded {
                        debug!("skip {} in {} (excluded)", req.symbol, map.path);
                        continue;
                    }
                    self.backend.register(
                        map.dev,
                        map.inode,
                        &req.symbol,
                        req.replacement as *mut c_void,
                        req.backup as *mut *mut c_void,
                    );
                }
            }
            pending.register.clear();
            pending.exclude.clear();
        }

        let maps = self.cached_maps();
        let ok = self.backend.commit(&maps);
        self.refresh_maps();
        ok
    }

    /// Restore every slot the backend rewrote.
    pub fn revert_all(&self) -> usize {
        let maps = self.cached_maps();
        self.backend.revert_all(&maps)
    }

    pub fn pending_len(&self) -> (usize, usize) {
        let pending = self.pending();
        (pending.register.len(), pending.exclude.len())
    }

    pub fn cached_maps(&self) -> Vec<MapInfo> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn refresh_maps(&self) {
        let fresh = self.backend.snapshot();
        *self.maps.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
    }
}
