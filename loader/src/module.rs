//! Per-module ABI adapter.
//!
//! Each loaded module owns an [`ApiTable`] whose `impl_` field points back
//! at its [`Module`]. The table's capability functions are plain C shims
//! that find the module through that pointer and the engine state through
//! the active interception context.

use core::cell::{Cell, UnsafeCell};
use core::ffi::{c_char, c_int, c_long, c_void};
use std::ffi::CStr;
use std::os::fd::IntoRawFd;

use log::{debug, warn};

use crate::api::{
    ApiLevel, ApiTable, AppArgsShape, AppSpecializeArgs, AppSpecializeArgsV1, Capabilities, CapabilitiesV1,
    CapabilitiesV4, ModuleAbi, ModuleEntry, ServerSpecializeArgs, ZygiskOption,
};
use crate::context::{with_active, EventFlags};
use crate::daemon::Daemon;
use crate::dl::ModuleLoader;
use crate::jni::{JNIEnv, JNINativeMethod};

#[derive(Debug, Clone, Copy)]
struct Negotiated {
    version: c_long,
    level: ApiLevel,
}

pub struct Module {
    id: usize,
    handle: *mut c_void,
    entry: ModuleEntry,
    api: UnsafeCell<ApiTable>,
    abi: Cell<*const ModuleAbi>,
    negotiated: Cell<Option<Negotiated>>,
    unload: Cell<bool>,
}

impl Module {
    /// Boxed so the table's back-pointer stays valid.
    pub fn new(id: usize, handle: *mut c_void, entry: ModuleEntry) -> Box<Module> {
        let module = Box::new(Module {
            id,
            handle,
            entry,
            api: UnsafeCell::new(ApiTable {
                impl_: core::ptr::null_mut(),
                register_module: Some(register_module_impl),
                caps: Capabilities::empty(),
            }),
            abi: Cell::new(core::ptr::null()),
            negotiated: Cell::new(None),
            unload: Cell::new(false),
        });
        let this = &*module as *const Module as *mut c_void;
        unsafe { (*module.api.get()).impl_ = this };
        module
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handle(&self) -> *mut c_void {
        self.handle
    }

    pub fn api_table(&self) -> *mut ApiTable {
        self.api.get()
    }

    /// Registered API version, if registration succeeded.
    pub fn api_version(&self) -> Option<c_long> {
        self.negotiated.get().map(|n| n.version)
    }

    pub fn api_level(&self) -> Option<ApiLevel> {
        self.negotiated.get().map(|n| n.level)
    }

    /// Run the module's entry point.
    pub fn on_load(&self, env: *mut JNIEnv) {
        unsafe { (self.entry)(self.api.get(), env) };
    }

    fn abi(&self) -> Option<&ModuleAbi> {
        let abi = self.abi.get();
        if abi.is_null() { None } else { Some(unsafe { &*abi }) }
    }

    /// Registered within the supported range, with all four callbacks and an
    /// implementation handle.
    pub fn is_valid(&self) -> bool {
        self.negotiated.get().is_some()
            && self.abi().is_some_and(|abi| {
                !abi.impl_.is_null()
                    && abi.pre_app_specialize.is_some()
                    && abi.post_app_specialize.is_some()
                    && abi.pre_server_specialize.is_some()
                    && abi.post_server_specialize.is_some()
            })
    }

    fn call_app(&self, args: *mut AppSpecializeArgs, pick: fn(&ModuleAbi) -> Option<crate::api::AppCallback>) {
        let (Some(abi), Some(negotiated)) = (self.abi(), self.negotiated.get()) else {
            return;
        };
        let Some(callback) = pick(abi) else {
            return;
        };
        match AppArgsShape::for_version(negotiated.version) {
            AppArgsShape::Full => unsafe { callback(abi.impl_, args.cast()) },
            AppArgsShape::Reduced => {
                let mut reduced = AppSpecializeArgsV1::from(unsafe { &*args });
                unsafe { callback(abi.impl_, (&mut reduced as *mut AppSpecializeArgsV1).cast()) };
            }
        }
    }

    pub fn pre_app_specialize(&self, args: *mut AppSpecializeArgs) {
        self.call_app(args, |abi| abi.pre_app_specialize);
    }

    pub fn post_app_specialize(&self, args: *mut AppSpecializeArgs) {
        self.call_app(args, |abi| abi.post_app_specialize);
    }

    pub fn pre_server_specialize(&self, args: *mut ServerSpecializeArgs) {
        if let Some(abi) = self.abi() {
            if let Some(callback) = abi.pre_server_specialize {
                unsafe { callback(abi.impl_, args) };
            }
        }
    }

    pub fn post_server_specialize(&self, args: *mut ServerSpecializeArgs) {
        if let Some(abi) = self.abi() {
            if let Some(callback) = abi.post_server_specialize {
                unsafe { callback(abi.impl_, args) };
            }
        }
    }

    pub fn request_unload(&self) {
        self.unload.set(true);
    }

    pub fn unload_requested(&self) -> bool {
        self.unload.get()
    }

    /// Close the library if the module asked for it. Returns true only when
    /// the library was actually closed.
    pub fn try_unload(&self, loader: &dyn ModuleLoader) -> bool {
        self.unload.get() && loader.close(self.handle)
    }

    pub fn connect_companion(&self, daemon: &dyn Daemon) -> c_int {
        match daemon.connect_companion(self.id) {
            Ok(fd) => fd.into_raw_fd(),
            Err(e) => {
                debug!("companion of module {}: {e:#}", self.id);
                -1
            }
        }
    }

    pub fn get_module_dir(&self, daemon: &dyn Daemon) -> c_int {
        match daemon.get_module_dir(self.id) {
            Ok(fd) => fd.into_raw_fd(),
            Err(e) => {
                warn!("module dir of module {}: {e:#}", self.id);
                -1
            }
        }
    }
}

/// Fill the capability union for `level`; nothing outside that variant is
/// touched.
fn install_capabilities(api: &mut ApiTable, level: ApiLevel) {
    match level {
        ApiLevel::V1 | ApiLevel::V2 => {
            let v2 = level == ApiLevel::V2;
            api.caps.v1 = CapabilitiesV1 {
                hook_jni_native_methods: Some(hook_jni_native_methods),
                plt_hook_register: Some(plt_hook_register),
                plt_hook_exclude: Some(plt_hook_exclude),
                plt_hook_commit: Some(plt_hook_commit),
                connect_companion: Some(connect_companion),
                set_option: Some(set_option),
                get_module_dir: if v2 { Some(get_module_dir) } else { None },
                get_flags: if v2 { Some(get_flags) } else { None },
            };
        }
        ApiLevel::V4 => {
            api.caps.v4 = CapabilitiesV4 {
                hook_jni_native_methods: Some(hook_jni_native_methods),
                plt_hook_register: Some(plt_hook_register_v4),
                exempt_fd: Some(exempt_fd),
                plt_hook_commit: Some(plt_hook_commit),
                connect_companion: Some(connect_companion),
                set_option: Some(set_option),
                get_module_dir: Some(get_module_dir),
                get_flags: Some(get_flags),
            };
        }
    }
}

// =============================================================================
// C SHIMS
// =============================================================================

unsafe fn module_from<'a>(impl_: *mut c_void) -> Option<&'a Module> {
    if impl_.is_null() { None } else { Some(unsafe { &*(impl_ as *const Module) }) }
}

unsafe fn c_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

/// `registerModule`: negotiate the version and install capabilities.
pub unsafe extern "C" fn register_module_impl(api: *mut ApiTable, abi: *mut ModuleAbi) -> bool {
    if api.is_null() || abi.is_null() {
        return false;
    }
    let api = unsafe { &mut *api };
    let Some(module) = (unsafe { module_from(api.impl_) }) else {
        return false;
    };
    let version = unsafe { (*abi).api_version };
    let Some(level) = ApiLevel::negotiate(version) else {
        warn!("module {} requested unsupported API version {version}", module.id);
        return false;
    };

    module.abi.set(abi);
    module.negotiated.set(Some(Negotiated { version, level }));
    install_capabilities(api, level);
    debug!("module {} registered with API {version}", module.id);
    true
}

unsafe extern "C" fn hook_jni_native_methods(_env: *mut JNIEnv, class: *const c_char, methods: *mut JNINativeMethod, count: c_int) {
    let class = unsafe { c_str(class) }.unwrap_or("<null>");
    if methods.is_null() || count <= 0 {
        return;
    }
    for i in 0..count as usize {
        unsafe { (*methods.add(i)).fn_ptr = core::ptr::null_mut() };
    }
    warn!("JNI native hooks are not supported; {count} method(s) of {class} left unhooked");
}

unsafe extern "C" fn plt_hook_register(regex: *const c_char, symbol: *const c_char, replacement: *mut c_void, backup: *mut *mut c_void) {
    let (Some(regex), Some(symbol)) = (unsafe { c_str(regex) }, unsafe { c_str(symbol) }) else {
        return;
    };
    with_active(|ctx| ctx.zygote().hooks().register(regex, symbol, replacement, backup));
}

unsafe extern "C" fn plt_hook_register_v4(dev: libc::dev_t, inode: libc::ino_t, symbol: *const c_char, replacement: *mut c_void, backup: *mut *mut c_void) {
    let Some(symbol) = (unsafe { c_str(symbol) }) else {
        return;
    };
    with_active(|ctx| ctx.zygote().hooks().register_by_id(dev as u64, inode as u64, symbol, replacement, backup));
}

unsafe extern "C" fn plt_hook_exclude(regex: *const c_char, symbol: *const c_char) {
    let Some(regex) = (unsafe { c_str(regex) }) else {
        return;
    };
    let symbol = unsafe { c_str(symbol) };
    with_active(|ctx| ctx.zygote().hooks().exclude(regex, symbol));
}

unsafe extern "C" fn plt_hook_commit() -> bool {
    with_active(|ctx| ctx.zygote().hooks().commit()).unwrap_or(false)
}

unsafe extern "C" fn exempt_fd(fd: c_int) -> bool {
    with_active(|ctx| ctx.exempt_fd(fd)).unwrap_or(false)
}

unsafe extern "C" fn connect_companion(impl_: *mut c_void) -> c_int {
    let Some(module) = (unsafe { module_from(impl_) }) else {
        return -1;
    };
    with_active(|ctx| module.connect_companion(ctx.zygote().daemon())).unwrap_or(-1)
}

unsafe extern "C" fn get_module_dir(impl_: *mut c_void) -> c_int {
    let Some(module) = (unsafe { module_from(impl_) }) else {
        return -1;
    };
    with_active(|ctx| module.get_module_dir(ctx.zygote().daemon())).unwrap_or(-1)
}

unsafe extern "C" fn set_option(impl_: *mut c_void, option: c_int) {
    let Some(module) = (unsafe { module_from(impl_) }) else {
        return;
    };
    with_active(|ctx| match ZygiskOption::from_raw(option) {
        Some(ZygiskOption::ForceDenylistUnmount) => ctx.escalate(EventFlags::DO_REVERT_UNMOUNT),
        Some(ZygiskOption::DlcloseModuleLibrary) => module.request_unload(),
        None => warn!("module {} set unknown option {option}", module.id),
    });
}

unsafe extern "C" fn get_flags(_impl: *mut c_void) -> u32 {
    with_active(|ctx| ctx.info_flags().public_bits()).unwrap_or(0)
}
