//! Batched GOT/PLT patching keyed by file identity.
//!
//! Requests are queued with [`register_hook`] and applied together by
//! [`commit_hook`] against a memory-map snapshot. Every slot that gets
//! rewritten is remembered with its first original value so that
//! [`revert_all`] can put the process back the way it was.

use core::ffi::c_void;
use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, warn};

use crate::code::write_pointer;
use crate::maps::{find_image_base, find_region, MapInfo};
use crate::module::ElfImage;
use crate::types::FileId;

struct Registration {
    id: FileId,
    symbol: String,
    callback: usize,
    backup: usize,
}

struct AppliedPatch {
    slot: usize,
    original: usize,
}

static PENDING: Mutex<Vec<Registration>> = Mutex::new(Vec::new());
static APPLIED: Mutex<Vec<AppliedPatch>> = Mutex::new(Vec::new());

/// Queue a replacement of every GOT slot bound to `symbol` in the image
/// identified by `dev`/`inode`.
///
/// When `backup` is non-null, the value found in the first rewritten slot is
/// stored there on commit. Returns false for an empty symbol, a null
/// callback or a zero file identity.
pub fn register_hook(dev: u64, inode: u64, symbol: &str, callback: *mut c_void, backup: *mut *mut c_void) -> bool {
    if dev == 0 || inode == 0 || symbol.is_empty() || callback.is_null() {
        return false;
    }
    PENDING.lock().unwrap_or_else(|e| e.into_inner()).push(Registration {
        id: FileId::new(dev, inode),
        symbol: symbol.to_string(),
        callback: callback as usize,
        backup: backup as usize,
    });
    true
}

/// Number of registrations waiting for the next commit.
pub fn pending_count() -> usize {
    PENDING.lock().unwrap_or_else(|e| e.into_inner()).len()
}

/// Apply every queued registration against `maps`.
///
/// The queue is drained whatever the outcome. Images that are not mapped
/// or do not import the symbol are skipped. Returns false only if an
/// image could not be parsed or a slot could not be written.
pub fn commit_hook(maps: &[MapInfo]) -> bool {
    let pending = std::mem::take(&mut *PENDING.lock().unwrap_or_else(|e| e.into_inner()));
    if pending.is_empty() {
        return true;
    }

    let mut images: HashMap<FileId, Option<ElfImage>> = HashMap::new();
    let mut ok = true;

    for reg in pending {
        let image = images.entry(reg.id).or_insert_with(|| {
            let base = find_image_base(maps, reg.id)?;
            match unsafe { ElfImage::from_base(base.start) } {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!("cannot parse {}: {e}", base.path);
                    ok = false;
                    None
                }
            }
        });
        let Some(image) = image else {
            debug!("no mapped image for dev {:#x} inode {}", reg.id.dev, reg.id.inode);
            continue;
        };

        let slots = image.relocation_slots(&reg.symbol);
        if slots.is_empty() {
            debug!("{} is not imported by image at {:#x}", reg.symbol, image.base());
            continue;
        }

        let mut backed_up = false;
        for slot in slots {
            let prot = find_region(maps, slot).map_or(libc::PROT_READ, |m| m.perms);
            match unsafe { write_pointer(slot, reg.callback, prot) } {
                Ok(previous) if previous == reg.callback => {}
                Ok(previous) => {
                    if !backed_up && reg.backup != 0 {
                        unsafe { *(reg.backup as *mut usize) = previous };
                        backed_up = true;
                    }
                    let mut applied = APPLIED.lock().unwrap_or_else(|e| e.into_inner());
                    if !applied.iter().any(|p| p.slot == slot) {
                        applied.push(AppliedPatch { slot, original: previous });
                    }
                }
                Err(e) => {
                    warn!("failed to patch {} slot: {e}", reg.symbol);
                    ok = false;
                }
            }
        }
    }
    ok
}

/// Restore every slot ever rewritten by [`commit_hook`] to its first
/// recorded value. Returns how many slots were restored.
pub fn revert_all(maps: &[MapInfo]) -> usize {
    let applied = std::mem::take(&mut *APPLIED.lock().unwrap_or_else(|e| e.into_inner()));
    let mut restored = 0;
    for patch in applied {
        let prot = find_region(maps, patch.slot).map_or(libc::PROT_READ, |m| m.perms);
        match unsafe { write_pointer(patch.slot, patch.original, prot) } {
            Ok(_) => restored += 1,
            Err(e) => warn!("failed to restore slot {:#x}: {e}", patch.slot),
        }
    }
    restored
}
