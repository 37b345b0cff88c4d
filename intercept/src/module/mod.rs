#[cfg(not(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64")))]
use crate::types::HookError;

#[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
mod linux;

#[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
pub use linux::*;

/// Only 64-bit Linux/Android images are parsed; everything else reports
/// [`HookError::Unsupported`].
#[cfg(not(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64")))]
#[derive(Debug, Clone)]
pub struct ElfImage;

#[cfg(not(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64")))]
impl ElfImage {
    /// # Safety
    /// Never dereferences `base` on this platform.
    pub unsafe fn from_base(_base: usize) -> Result<Self, HookError> {
        Err(HookError::Unsupported)
    }

    pub fn relocation_slots(&self, _symbol: &str) -> Vec<usize> {
        Vec::new()
    }
}
