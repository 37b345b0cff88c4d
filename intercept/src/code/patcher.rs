use crate::types::HookError;

#[inline]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

/// Replace the pointer stored at `slot` with `value`, returning the previous
/// contents.
///
/// `prot` is the current protection of the page holding `slot` (as reported
/// by the maps snapshot). Read-only pages are made writable for the duration
/// of the write and restored to `prot` afterwards.
///
/// # Safety
/// `slot` must be a pointer-aligned address inside a mapped region of this
/// process, and no other thread may be relying on the old value.
pub unsafe fn write_pointer(slot: usize, value: usize, prot: i32) -> Result<usize, HookError> {
    if slot == 0 || slot % core::mem::align_of::<usize>() != 0 {
        return Err(HookError::ProtectFailed(slot));
    }

    let page_sz = page_size();
    let page = (slot & !(page_sz - 1)) as *mut libc::c_void;
    let writable = prot & libc::PROT_WRITE != 0;

    if !writable && unsafe { libc::mprotect(page, page_sz, prot | libc::PROT_READ | libc::PROT_WRITE) } != 0 {
        return Err(HookError::ProtectFailed(slot));
    }

    let previous = unsafe { core::ptr::read_volatile(slot as *const usize) };
    unsafe { core::ptr::write_volatile(slot as *mut usize, value) };

    if !writable && unsafe { libc::mprotect(page, page_sz, prot) } != 0 {
        log::warn!("failed to restore protection {prot:#x} at {slot:#x}");
    }
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_into_writable_memory() {
        let mut slot: usize = 0x1111;
        let addr = &mut slot as *mut usize as usize;
        let previous = unsafe { write_pointer(addr, 0x2222, libc::PROT_READ | libc::PROT_WRITE) }.expect("write");
        assert_eq!(previous, 0x1111);
        assert_eq!(unsafe { core::ptr::read_volatile(addr as *const usize) }, 0x2222);
    }

    #[test]
    fn writes_through_read_only_page_and_restores_it() {
        let page_sz = page_size();
        let page = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                page_sz,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        unsafe {
            (page as *mut usize).write(7);
            assert_eq!(libc::mprotect(page, page_sz, libc::PROT_READ), 0);
        }

        let slot = page as usize + 8 * core::mem::size_of::<usize>();
        let previous = unsafe { write_pointer(slot, 42, libc::PROT_READ) }.expect("write");
        assert_eq!(previous, 0);
        assert_eq!(unsafe { *(slot as *const usize) }, 42);

        let maps = crate::maps::MapInfo::scan_self();
        let region = crate::maps::find_region(&maps, slot).expect("mapped");
        assert!(!region.is_writable());

        unsafe { libc::munmap(page, page_sz) };
    }

    #[test]
    fn rejects_unaligned_slots() {
        let err = unsafe { write_pointer(3, 0, libc::PROT_READ) }.unwrap_err();
        assert_eq!(err, HookError::ProtectFailed(3));
    }
}
