//! Loading module libraries from descriptors.

use core::ffi::{c_int, c_void};
use std::ffi::CString;
use std::os::fd::AsRawFd;

use log::{debug, warn};

use crate::api::ModuleEntry;
use crate::daemon::ModuleImage;

/// Name every module library is loaded under.
pub const MODULE_LOAD_NAME: &str = "jit-cache-zygisk";

const ENTRY_SYMBOL: &core::ffi::CStr = c"zygisk_module_entry";

/// A loaded module library and its resolved entry point.
#[derive(Debug, Clone, Copy)]
pub struct LoadedLibrary {
    pub handle: *mut c_void,
    pub entry: ModuleEntry,
}

pub trait ModuleLoader: Send + Sync {
    /// Load `image` and resolve its entry; `None` if either step fails.
    fn open(&self, image: &ModuleImage) -> Option<LoadedLibrary>;

    /// Unload a handle returned by [`ModuleLoader::open`].
    fn close(&self, handle: *mut c_void) -> bool;
}

/// Loader backed by the platform dynamic linker.
#[derive(Debug, Default)]
pub struct DlLoader;

#[cfg(target_os = "android")]
mod android {
    use core::ffi::{c_char, c_int, c_void};

    pub const ANDROID_DLEXT_USE_LIBRARY_FD: u64 = 0x10;

    #[repr(C)]
    pub struct AndroidDlextinfo {
        pub flags: u64,
        pub reserved_addr: *mut c_void,
        pub reserved_size: libc::size_t,
        pub relro_fd: c_int,
        pub library_fd: c_int,
        pub library_fd_offset: libc::off64_t,
        pub library_namespace: *mut c_void,
    }

    unsafe extern "C" {
        pub fn android_dlopen_ext(filename: *const c_char, flags: c_int, info: *const AndroidDlextinfo) -> *mut c_void;
    }
}

impl DlLoader {
    #[cfg(target_os = "android")]
    fn dlopen_fd(&self, fd: c_int) -> *mut c_void {
        let info = android::AndroidDlextinfo {
            flags: android::ANDROID_DLEXT_USE_LIBRARY_FD,
            reserved_addr: core::ptr::null_mut(),
            reserved_size: 0,
            relro_fd: 0,
            library_fd: fd,
            library_fd_offset: 0,
            library_namespace: core::ptr::null_mut(),
        };
        let Ok(name) = CString::new(MODULE_LOAD_NAME) else {
            return core::ptr::null_mut();
        };
        unsafe { android::android_dlopen_ext(name.as_ptr(), libc::RTLD_NOW, &info) }
    }

    #[cfg(not(target_os = "android"))]
    fn dlopen_fd(&self, fd: c_int) -> *mut c_void {
        let Ok(path) = CString::new(format!("/proc/self/fd/{fd}")) else {
            return core::ptr::null_mut();
        };
        unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) }
    }
}

fn dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { std::ffi::CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

impl ModuleLoader for DlLoader {
    fn open(&self, image: &ModuleImage) -> Option<LoadedLibrary> {
        let handle = self.dlopen_fd(image.fd.as_raw_fd());
        if handle.is_null() {
            warn!("failed to load module [{}]: {}", image.name, dl_error());
            return None;
        }

        let entry = unsafe { libc::dlsym(handle, ENTRY_SYMBOL.as_ptr()) };
        if entry.is_null() {
            warn!("module [{}] has no zygisk_module_entry", image.name);
            unsafe { libc::dlclose(handle) };
            return None;
        }

        debug!("loaded module [{}] at {:p}", image.name, handle);
        // SAFETY: the exported symbol has the documented entry signature.
        let entry = unsafe { core::mem::transmute::<*mut c_void, ModuleEntry>(entry) };
        Some(LoadedLibrary { handle, entry })
    }

    fn close(&self, handle: *mut c_void) -> bool {
        if handle.is_null() {
            return false;
        }
        unsafe { libc::dlclose(handle) == 0 }
    }
}
