//! In-place edits of whole memory regions.

use std::ffi::CStr;

use crate::maps::MapInfo;

const PR_SET_VMA: libc::c_int = 0x53564d41;
const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;

/// Overwrite every occurrence of `needle` inside `region` with zero bytes.
///
/// Returns the number of occurrences rewritten. Regions that are not both
/// readable and writable are left alone.
///
/// # Safety
/// `region` must describe memory currently mapped in this process. The
/// region may be live (a thread stack, for instance); bytes are accessed
/// with volatile reads and writes only.
pub unsafe fn overwrite_occurrences(region: &MapInfo, needle: &[u8]) -> usize {
    if needle.is_empty() || !region.is_readable() || !region.is_writable() || region.len() < needle.len() {
        return 0;
    }

    let base = region.start as *mut u8;
    let last = region.len() - needle.len();
    let mut hits = 0;
    let mut i = 0;
    while i <= last {
        let matched = needle
            .iter()
            .enumerate()
            .all(|(j, b)| unsafe { core::ptr::read_volatile(base.add(i + j)) } == *b);
        if matched {
            for j in 0..needle.len() {
                unsafe { core::ptr::write_volatile(base.add(i + j), 0) };
            }
            hits += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    hits
}

/// Set (or with `None`, clear) the `[anon:<name>]` label of an anonymous
/// mapping. Returns false if the kernel refused.
pub fn set_anon_name(start: usize, len: usize, name: Option<&CStr>) -> bool {
    let name_ptr = name.map_or(core::ptr::null(), CStr::as_ptr);
    // SAFETY: prctl only reads the name string, which outlives the call.
    let rc = unsafe { libc::prctl(PR_SET_VMA, PR_SET_VMA_ANON_NAME, start as libc::c_ulong, len as libc::c_ulong, name_ptr) };
    rc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_of(buf: &mut [u8]) -> MapInfo {
        MapInfo {
            start: buf.as_mut_ptr() as usize,
            end: buf.as_mut_ptr() as usize + buf.len(),
            perms: libc::PROT_READ | libc::PROT_WRITE,
            is_private: true,
            offset: 0,
            dev: 0,
            inode: 0,
            path: String::new(),
        }
    }

    #[test]
    fn zeroes_every_occurrence() {
        let mut buf = *b"xxref_profilesyyref_profileszz";
        let region = region_of(&mut buf);
        let hits = unsafe { overwrite_occurrences(&region, b"ref_profiles") };
        assert_eq!(hits, 2);
        assert_eq!(&buf[..2], b"xx");
        assert!(buf[2..14].iter().all(|b| *b == 0));
        assert_eq!(&buf[14..16], b"yy");
        assert_eq!(&buf[28..], b"zz");
    }

    #[test]
    fn read_only_regions_are_skipped() {
        let mut buf = *b"ref_profiles";
        let mut region = region_of(&mut buf);
        region.perms = libc::PROT_READ;
        assert_eq!(unsafe { overwrite_occurrences(&region, b"ref_profiles") }, 0);
        assert_eq!(&buf, b"ref_profiles");
    }

    #[test]
    fn needle_longer_than_region() {
        let mut buf = *b"ref";
        let region = region_of(&mut buf);
        assert_eq!(unsafe { overwrite_occurrences(&region, b"ref_profiles") }, 0);
    }
}
