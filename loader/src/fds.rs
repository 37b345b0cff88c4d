//! Descriptor allow-list used by the sanitizer.

use std::os::fd::RawFd;

/// Fixed-capacity set of descriptors that survive sanitization.
///
/// Descriptors outside `0..capacity` can never be allowed; they are treated
/// as disallowed instead of growing the set.
#[derive(Debug, Clone)]
pub struct AllowList {
    slots: Box<[bool]>,
}

impl AllowList {
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![false; capacity].into_boxed_slice() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Mark `fd` as allowed. Returns false if it is out of range.
    pub fn allow(&mut self, fd: RawFd) -> bool {
        match usize::try_from(fd).ok().and_then(|i| self.slots.get_mut(i)) {
            Some(slot) => {
                *slot = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        usize::try_from(fd).ok().and_then(|i| self.slots.get(i)).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| **s).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
