//! C ABI shared with zygisk modules.
//!
//! Layouts here are part of the module contract and must not change:
//! modules are compiled against them and read fields by offset.

use core::ffi::{c_char, c_int, c_long, c_void};

use crate::jni::{jboolean, jint, jintArray, jlong, jobjectArray, jstring, JNIEnv, JNINativeMethod};

/// Highest module API version this engine implements.
pub const ZYGISK_API_VERSION: c_long = 5;

/// Option codes accepted by `setOption`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum ZygiskOption {
    ForceDenylistUnmount = 0,
    DlcloseModuleLibrary = 1,
}

impl ZygiskOption {
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            0 => Some(Self::ForceDenylistUnmount),
            1 => Some(Self::DlcloseModuleLibrary),
            _ => None,
        }
    }
}

// =============================================================================
// SPECIALIZATION ARGUMENTS
// =============================================================================

/// Application specialization arguments, full shape (API 3 and later).
///
/// Every field points at the launcher's own argument storage; optional
/// fields are null when the platform does not pass them.
#[repr(C)]
#[derive(Debug)]
pub struct AppSpecializeArgs {
    pub uid: *mut jint,
    pub gid: *mut jint,
    pub gids: *mut jintArray,
    pub runtime_flags: *mut jint,
    pub rlimits: *mut jobjectArray,
    pub mount_external: *mut jint,
    pub se_info: *mut jstring,
    pub nice_name: *mut jstring,
    pub instruction_set: *mut jstring,
    pub app_data_dir: *mut jstring,

    pub fds_to_ignore: *mut jintArray,
    pub is_child_zygote: *mut jboolean,
    pub is_top_app: *mut jboolean,
    pub pkg_data_info_list: *mut jobjectArray,
    pub whitelisted_data_info_list: *mut jobjectArray,
    pub mount_data_dirs: *mut jboolean,
    pub mount_storage_dirs: *mut jboolean,
    pub mount_sysprop_overrides: *mut jboolean,
}

/// Reduced application argument shape seen by API 1 and 2 modules.
#[repr(C)]
#[derive(Debug)]
pub struct AppSpecializeArgsV1 {
    pub uid: *mut jint,
    pub gid: *mut jint,
    pub gids: *mut jintArray,
    pub runtime_flags: *mut jint,
    pub mount_external: *mut jint,
    pub se_info: *mut jstring,
    pub nice_name: *mut jstring,
    pub instruction_set: *mut jstring,
    pub app_data_dir: *mut jstring,

    pub is_child_zygote: *mut jboolean,
    pub is_top_app: *mut jboolean,
    pub pkg_data_info_list: *mut jobjectArray,
    pub whitelisted_data_info_list: *mut jobjectArray,
    pub mount_data_dirs: *mut jboolean,
    pub mount_storage_dirs: *mut jboolean,
}

impl From<&AppSpecializeArgs> for AppSpecializeArgsV1 {
    fn from(args: &AppSpecializeArgs) -> Self {
        Self {
            uid: args.uid,
            gid: args.gid,
            gids: args.gids,
            runtime_flags: args.runtime_flags,
            mount_external: args.mount_external,
            se_info: args.se_info,
            nice_name: args.nice_name,
            instruction_set: args.instruction_set,
            app_data_dir: args.app_data_dir,
            is_child_zygote: args.is_child_zygote,
            is_top_app: args.is_top_app,
            pkg_data_info_list: args.pkg_data_info_list,
            whitelisted_data_info_list: args.whitelisted_data_info_list,
            mount_data_dirs: args.mount_data_dirs,
            mount_storage_dirs: args.mount_storage_dirs,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct ServerSpecializeArgs {
    pub uid: *mut jint,
    pub gid: *mut jint,
    pub gids: *mut jintArray,
    pub runtime_flags: *mut jint,
    pub permitted_capabilities: *mut jlong,
    pub effective_capabilities: *mut jlong,
}

// =============================================================================
// MODULE SIDE
// =============================================================================

pub type AppCallback = unsafe extern "C" fn(*mut c_void, *mut c_void);
pub type ServerCallback = unsafe extern "C" fn(*mut c_void, *mut ServerSpecializeArgs);

/// Callback table a module registers with `registerModule`.
#[repr(C)]
#[derive(Debug)]
pub struct ModuleAbi {
    pub api_version: c_long,
    pub impl_: *mut c_void,
    pub pre_app_specialize: Option<AppCallback>,
    pub post_app_specialize: Option<AppCallback>,
    pub pre_server_specialize: Option<ServerCallback>,
    pub post_server_specialize: Option<ServerCallback>,
}

/// `zygisk_module_entry` as exported by every module library.
pub type ModuleEntry = unsafe extern "C" fn(*mut ApiTable, *mut JNIEnv);

// =============================================================================
// ENGINE SIDE
// =============================================================================

pub type RegisterModuleFn = unsafe extern "C" fn(*mut ApiTable, *mut ModuleAbi) -> bool;
pub type HookJniNativeMethodsFn = unsafe extern "C" fn(*mut JNIEnv, *const c_char, *mut JNINativeMethod, c_int);
pub type PltHookRegisterFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut c_void, *mut *mut c_void);
pub type PltHookRegisterV4Fn = unsafe extern "C" fn(libc::dev_t, libc::ino_t, *const c_char, *mut c_void, *mut *mut c_void);
pub type PltHookExcludeFn = unsafe extern "C" fn(*const c_char, *const c_char);
pub type PltHookCommitFn = unsafe extern "C" fn() -> bool;
pub type ExemptFdFn = unsafe extern "C" fn(c_int) -> bool;
pub type ConnectCompanionFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type SetOptionFn = unsafe extern "C" fn(*mut c_void, c_int);
pub type GetModuleDirFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type GetFlagsFn = unsafe extern "C" fn(*mut c_void) -> u32;

/// Capabilities of API 1 to 3.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CapabilitiesV1 {
    pub hook_jni_native_methods: Option<HookJniNativeMethodsFn>,
    pub plt_hook_register: Option<PltHookRegisterFn>,
    pub plt_hook_exclude: Option<PltHookExcludeFn>,
    pub plt_hook_commit: Option<PltHookCommitFn>,
    pub connect_companion: Option<ConnectCompanionFn>,
    pub set_option: Option<SetOptionFn>,
    /// API 2 and later.
    pub get_module_dir: Option<GetModuleDirFn>,
    /// API 2 and later.
    pub get_flags: Option<GetFlagsFn>,
}

/// Capabilities of API 4 and 5.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CapabilitiesV4 {
    pub hook_jni_native_methods: Option<HookJniNativeMethodsFn>,
    pub plt_hook_register: Option<PltHookRegisterV4Fn>,
    pub exempt_fd: Option<ExemptFdFn>,
    pub plt_hook_commit: Option<PltHookCommitFn>,
    pub connect_companion: Option<ConnectCompanionFn>,
    pub set_option: Option<SetOptionFn>,
    pub get_module_dir: Option<GetModuleDirFn>,
    pub get_flags: Option<GetFlagsFn>,
}

/// The two capability layouts share storage; which one is live depends on
/// the version the module registered with.
#[repr(C)]
#[derive(Clone, Copy)]
pub union Capabilities {
    pub v1: CapabilitiesV1,
    pub v4: CapabilitiesV4,
}

impl Capabilities {
    pub const fn empty() -> Self {
        Self {
            v1: CapabilitiesV1 {
                hook_jni_native_methods: None,
                plt_hook_register: None,
                plt_hook_exclude: None,
                plt_hook_commit: None,
                connect_companion: None,
                set_option: None,
                get_module_dir: None,
                get_flags: None,
            },
        }
    }
}

/// Table handed to `zygisk_module_entry`.
#[repr(C)]
pub struct ApiTable {
    pub impl_: *mut c_void,
    pub register_module: Option<RegisterModuleFn>,
    pub caps: Capabilities,
}

// =============================================================================
// VERSION NEGOTIATION
// =============================================================================

/// Capability layout family selected at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiLevel {
    /// API 1: base capabilities, V1 layout.
    V1,
    /// API 2 and 3: adds module directory and flags, V1 layout.
    V2,
    /// API 4 and 5: V4 layout with device/inode hooks and fd exemption.
    V4,
}

impl ApiLevel {
    pub fn negotiate(version: c_long) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            2 | 3 => Some(Self::V2),
            4 | 5 => Some(Self::V4),
            _ => None,
        }
    }
}

/// Argument shape an application callback receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppArgsShape {
    Reduced,
    Full,
}

impl AppArgsShape {
    pub fn for_version(version: c_long) -> Self {
        if version >= 3 { Self::Full } else { Self::Reduced }
    }
}
