//! The three intercepted specialization entry points and the fork hook.

use core::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::api::{AppSpecializeArgs, ServerSpecializeArgs};
use crate::context::{with_active, Context};
use crate::jni::{JNIEnv, JniRuntime, Runtime};
use crate::zygote::Zygote;

/// Pattern of the runtime library whose `fork` import gets replaced.
pub const FORK_HOOK_TARGET: &str = r"/libandroid_runtime\.so$";

/// Address of the original `fork`, written by the hook backend.
static ORIGINAL_FORK: AtomicUsize = AtomicUsize::new(0);

/// Call `fork` bypassing the engine's own replacement.
pub fn original_fork() -> libc::pid_t {
    let addr = ORIGINAL_FORK.load(Ordering::SeqCst);
    if addr == 0 {
        return unsafe { libc::fork() };
    }
    // SAFETY: the slot only ever holds the previous GOT value for `fork`.
    let fork = unsafe { core::mem::transmute::<usize, extern "C" fn() -> libc::pid_t>(addr) };
    fork()
}

/// Replacement for the runtime library's `fork`: while an event is active
/// and the engine already forked, hand back that result.
pub extern "C" fn fork_replacement() -> libc::pid_t {
    match with_active(|ctx| ctx.forked_pid()).flatten() {
        Some(pid) if pid >= 0 => pid,
        _ => original_fork(),
    }
}

/// Route the runtime library's `fork` through [`fork_replacement`].
pub fn install_fork_hook(zygote: &Zygote) -> bool {
    let hooks = zygote.hooks();
    let queued = hooks.register(
        FORK_HOOK_TARGET,
        "fork",
        fork_replacement as *mut c_void,
        ORIGINAL_FORK.as_ptr().cast(),
    );
    queued && hooks.commit()
}

/// `nativeForkAndSpecialize`: fork an application process.
pub fn fork_and_specialize<R>(
    zygote: &Zygote,
    runtime: &dyn Runtime,
    args: &mut AppSpecializeArgs,
    original: impl FnOnce() -> R,
) -> R {
    let ctx = Context::for_app(zygote, runtime, args);
    let _active = ctx.activate();
    ctx.fork_and_specialize_pre();
    let result = original();
    ctx.fork_and_specialize_post();
    result
}

/// `nativeSpecializeAppProcess`: re-specialize without forking.
pub fn specialize_app_process<R>(
    zygote: &Zygote,
    runtime: &dyn Runtime,
    args: &mut AppSpecializeArgs,
    original: impl FnOnce() -> R,
) -> R {
    let ctx = Context::for_app(zygote, runtime, args);
    let _active = ctx.activate();
    ctx.specialize_app_pre();
    let result = original();
    ctx.specialize_app_post();
    result
}

/// `nativeForkSystemServer`: fork the system server.
pub fn fork_system_server<R>(
    zygote: &Zygote,
    runtime: &dyn Runtime,
    args: &mut ServerSpecializeArgs,
    original: impl FnOnce() -> R,
) -> R {
    let ctx = Context::for_server(zygote, runtime, args);
    let _active = ctx.activate();
    ctx.fork_system_server_pre();
    let result = original();
    ctx.fork_system_server_post();
    result
}

// =============================================================================
// C EXPORTS
// =============================================================================

/// Original native method, invoked with the caller's opaque data.
pub type ForkOriginal = unsafe extern "C" fn(*mut c_void) -> libc::pid_t;
pub type SpecializeOriginal = unsafe extern "C" fn(*mut c_void);

/// # Safety
/// `env` must be the calling thread's `JNIEnv*` and `args` must point at
/// argument storage that stays valid until `original` returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zygisk_fork_and_specialize(
    env: *mut JNIEnv,
    args: *mut AppSpecializeArgs,
    original: ForkOriginal,
    data: *mut c_void,
) -> libc::pid_t {
    let (Some(zygote), Some(runtime), Some(args)) =
        (Zygote::global(), unsafe { JniRuntime::from_raw(env) }, unsafe { args.as_mut() })
    else {
        debug!("forkAndSpecialize passed through");
        return unsafe { original(data) };
    };
    fork_and_specialize(zygote, &runtime, args, || unsafe { original(data) })
}

/// # Safety
/// Same contract as [`zygisk_fork_and_specialize`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zygisk_specialize_app_process(
    env: *mut JNIEnv,
    args: *mut AppSpecializeArgs,
    original: SpecializeOriginal,
    data: *mut c_void,
) {
    let (Some(zygote), Some(runtime), Some(args)) =
        (Zygote::global(), unsafe { JniRuntime::from_raw(env) }, unsafe { args.as_mut() })
    else {
        debug!("specializeAppProcess passed through");
        return unsafe { original(data) };
    };
    specialize_app_process(zygote, &runtime, args, || unsafe { original(data) })
}

/// # Safety
/// Same contract as [`zygisk_fork_and_specialize`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zygisk_fork_system_server(
    env: *mut JNIEnv,
    args: *mut ServerSpecializeArgs,
    original: ForkOriginal,
    data: *mut c_void,
) -> libc::pid_t {
    let (Some(zygote), Some(runtime), Some(args)) =
        (Zygote::global(), unsafe { JniRuntime::from_raw(env) }, unsafe { args.as_mut() })
    else {
        debug!("forkSystemServer passed through");
        return unsafe { original(data) };
    };
    fork_system_server(zygote, &runtime, args, || unsafe { original(data) })
}
