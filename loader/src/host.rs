//! Operating-system services used by the engine.
//!
//! Everything the context does to the process itself (forking, closing
//! descriptors, detaching mounts) goes through [`Host`] so the event logic
//! can be exercised against a fake.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::debug;
use zygisk_intercept::code::set_anon_name;
use zygisk_intercept::MapInfo;

use crate::dl::MODULE_LOAD_NAME;

pub trait Host: Send + Sync {
    /// Fork through the original (unhooked) `fork`.
    fn fork(&self) -> libc::pid_t;

    fn set_sigchld_blocked(&self, blocked: bool);

    /// Descriptors currently open, excluding any descriptor used to
    /// enumerate them.
    fn open_fds(&self) -> Vec<RawFd>;

    fn close_fd(&self, fd: RawFd);

    /// Soft `RLIMIT_NOFILE`.
    fn fd_limit(&self) -> usize;

    /// Owning uid of `path`.
    fn file_owner(&self, path: &Path) -> Option<u32>;

    /// Contents of `/proc/self/mountinfo`.
    fn mount_info(&self) -> io::Result<String>;

    /// Lazily detach the mount at `target`.
    fn lazy_unmount(&self, target: &str) -> io::Result<()>;

    /// Switch to the mount namespace referred to by `path`.
    fn join_mount_namespace(&self, path: &str) -> io::Result<()>;

    /// Remove the engine's marker names from anonymous mappings. Returns the
    /// number of regions renamed.
    fn scrub_anon_names(&self) -> usize;

    fn set_env(&self, key: &str, value: &str);

    fn pid(&self) -> u32 {
        std::process::id()
    }
}

/// [`Host`] for the running process.
#[derive(Debug, Default)]
pub struct LinuxHost;

impl Host for LinuxHost {
    fn fork(&self) -> libc::pid_t {
        crate::entry::original_fork()
    }

    fn set_sigchld_blocked(&self, blocked: bool) {
        unsafe {
            let mut set: libc::sigset_t = core::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGCHLD);
            let how = if blocked { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK };
            libc::pthread_sigmask(how, &set, core::ptr::null_mut());
        }
    }

    fn open_fds(&self) -> Vec<RawFd> {
        let dir = unsafe { libc::opendir(c"/proc/self/fd".as_ptr()) };
        if dir.is_null() {
            return Vec::new();
        }
        let dir_fd = unsafe { libc::dirfd(dir) };
        let mut fds = Vec::new();
        loop {
            let entry = unsafe { libc::readdir(dir) };
            if entry.is_null() {
                break;
            }
            let name = unsafe { std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) };
            if let Some(fd) = name.to_str().ok().and_then(|n| n.parse::<RawFd>().ok()) {
                if fd != dir_fd {
                    fds.push(fd);
                }
            }
        }
        unsafe { libc::closedir(dir) };
        fds
    }

    fn close_fd(&self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn fd_limit(&self) -> usize {
        let mut limit: libc::rlimit = unsafe { core::mem::zeroed() };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
            return crate::config::MAX_FDS_CEILING;
        }
        usize::try_from(limit.rlim_cur).unwrap_or(crate::config::MAX_FDS_CEILING)
    }

    fn file_owner(&self, path: &Path) -> Option<u32> {
        std::fs::metadata(path).ok().map(|m| m.uid())
    }

    fn mount_info(&self) -> io::Result<String> {
        std::fs::read_to_string("/proc/self/mountinfo")
    }

    fn lazy_unmount(&self, target: &str) -> io::Result<()> {
        let target = CString::new(target).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn join_mount_namespace(&self, path: &str) -> io::Result<()> {
        let ns = std::fs::File::open(path)?;
        if unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNS) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn scrub_anon_names(&self) -> usize {
        MapInfo::scan_self()
            .iter()
            .filter(|m| m.has_anon_name(MODULE_LOAD_NAME))
            .filter(|m| set_anon_name(m.start, m.len(), None))
            .inspect(|m| debug!("cleared name of {:#x}-{:#x}", m.start, m.end))
            .count()
    }

    fn set_env(&self, key: &str, value: &str) {
        // SAFETY: called while the process is single-threaded, between fork
        // and the return into managed code.
        unsafe { std::env::set_var(key, value) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fds_lists_new_descriptor() {
        let file = tempfile::tempfile().expect("tempfile");
        let fd = file.as_raw_fd();
        let fds = LinuxHost.open_fds();
        assert!(fds.contains(&fd));
    }

    #[test]
    fn file_owner_reports_uid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uid = unsafe { libc::getuid() };
        assert_eq!(LinuxHost.file_owner(dir.path()), Some(uid));
        assert_eq!(LinuxHost.file_owner(&dir.path().join("missing")), None);
    }

    #[test]
    fn fd_limit_is_positive() {
        assert!(LinuxHost.fd_limit() > 0);
    }

    #[test]
    fn mountinfo_is_readable() {
        let text = LinuxHost.mount_info().expect("mountinfo");
        assert!(!text.is_empty());
    }
}
