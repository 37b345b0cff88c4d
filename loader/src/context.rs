//! Per-event interception context.
//!
//! A [`Context`] lives on the stack of one intercepted specialization call.
//! While it is active, the module capability shims reach it through a
//! thread-local pointer installed by [`Context::activate`].

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::path::Path;

use bitflags::bitflags;
use log::{debug, error, info, warn};
use zygisk_intercept::code::overwrite_occurrences;
use zygisk_protocol::{MountNamespace, ProcessFlags};

use crate::api::{AppSpecializeArgs, ServerSpecializeArgs};
use crate::fds::AllowList;
use crate::jni::Runtime;
use crate::module::Module;
use crate::mount;
use crate::zygote::Zygote;

pub const AID_ISOLATED_START: u32 = 99000;
pub const AID_ISOLATED_END: u32 = 99999;

const SERVER_FOSSIL_REGION: &str = "stack_and_tls:main";
const SERVER_FOSSIL: &[u8] = b"ref_profiles";

bitflags! {
    /// What the current event is and what it has asked for so far.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        const APP_FORK_AND_SPECIALIZE = 1 << 0;
        const APP_SPECIALIZE = 1 << 1;
        const SERVER_FORK_AND_SPECIALIZE = 1 << 2;
        const DO_REVERT_UNMOUNT = 1 << 3;
        /// Re-specialization without a fork: descriptors are left alone.
        const SKIP_FD_CHECK = 1 << 4;
        const POST_SPECIALIZE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy)]
enum EventArgs {
    App(*mut AppSpecializeArgs),
    Server(*mut ServerSpecializeArgs),
}

thread_local! {
    static ACTIVE: Cell<*const ()> = const { Cell::new(core::ptr::null()) };
}

/// Keeps a context installed as the thread's active context.
pub struct ActiveGuard<'c> {
    previous: *const (),
    _ctx: PhantomData<&'c ()>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

/// Run `f` against the context active on this thread, if any.
pub fn with_active<R>(f: impl FnOnce(&Context<'_>) -> R) -> Option<R> {
    let ptr = ACTIVE.with(|active| active.get());
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the pointer was installed by `activate` and the guard borrowing
    // that context restores the previous value before the context can move.
    Some(f(unsafe { &*(ptr as *const Context<'_>) }))
}

pub struct Context<'a> {
    zygote: &'a Zygote,
    runtime: &'a dyn Runtime,
    args: EventArgs,
    flags: Cell<EventFlags>,
    info_flags: Cell<ProcessFlags>,
    /// Result of the engine's own fork; `None` when the event does not fork.
    pid: Cell<Option<libc::pid_t>>,
    process: RefCell<Option<String>>,
    modules: RefCell<Vec<Box<Module>>>,
    allowed_fds: RefCell<AllowList>,
    exempted_fds: RefCell<Vec<RawFd>>,
    _args: PhantomData<&'a mut ()>,
}

impl<'a> Context<'a> {
    fn new(zygote: &'a Zygote, runtime: &'a dyn Runtime, args: EventArgs) -> Self {
        Self {
            zygote,
            runtime,
            args,
            flags: Cell::new(EventFlags::empty()),
            info_flags: Cell::new(ProcessFlags::empty()),
            pid: Cell::new(None),
            process: RefCell::new(None),
            modules: RefCell::new(Vec::new()),
            allowed_fds: RefCell::new(AllowList::new(zygote.fd_capacity())),
            exempted_fds: RefCell::new(Vec::new()),
            _args: PhantomData,
        }
    }

    pub fn for_app(zygote: &'a Zygote, runtime: &'a dyn Runtime, args: &'a mut AppSpecializeArgs) -> Self {
        Self::new(zygote, runtime, EventArgs::App(args))
    }

    pub fn for_server(zygote: &'a Zygote, runtime: &'a dyn Runtime, args: &'a mut ServerSpecializeArgs) -> Self {
        Self::new(zygote, runtime, EventArgs::Server(args))
    }

    /// Make this the thread's active context until the guard drops.
    pub fn activate(&self) -> ActiveGuard<'_> {
        let previous = ACTIVE.with(|active| active.replace(self as *const Context<'_> as *const ()));
        ActiveGuard { previous, _ctx: PhantomData }
    }

    pub fn zygote(&self) -> &'a Zygote {
        self.zygote
    }

    pub fn flags(&self) -> EventFlags {
        self.flags.get()
    }

    /// Add event flags; flags are never cleared during an event.
    pub fn escalate(&self, flags: EventFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    pub fn info_flags(&self) -> ProcessFlags {
        self.info_flags.get()
    }

    pub fn forked_pid(&self) -> Option<libc::pid_t> {
        self.pid.get()
    }

    pub fn process_name(&self) -> Option<String> {
        self.process.borrow().clone()
    }

    fn is_forked_child(&self) -> bool {
        self.pid.get() == Some(0)
    }

    fn app_args(&self) -> Option<&AppSpecializeArgs> {
        match self.args {
            EventArgs::App(args) => unsafe { args.as_ref() },
            EventArgs::Server(_) => None,
        }
    }

    fn label(&self) -> String {
        self.process.borrow().clone().unwrap_or_else(|| "<unknown>".to_string())
    }

    fn resolve_process_name(&self) {
        let name = self
            .app_args()
            .and_then(|args| read(args.nice_name))
            .and_then(|name| self.runtime.string(name));
        *self.process.borrow_mut() = name;
    }

    // =========================================================================
    // ENTRY FLOWS
    // =========================================================================

    pub fn fork_and_specialize_pre(&self) {
        self.resolve_process_name();
        debug!("pre forkAndSpecialize [{}]", self.label());
        self.escalate(EventFlags::APP_FORK_AND_SPECIALIZE);

        self.revert_zygote_mounts();
        self.fork_pre();
        if self.is_forked_child() {
            self.app_specialize_pre();
        }
        self.sanitize_fds();
    }

    pub fn fork_and_specialize_post(&self) {
        if self.is_forked_child() {
            debug!("post forkAndSpecialize [{}]", self.label());
            self.app_specialize_post();
        }
        self.fork_post();
    }

    pub fn specialize_app_pre(&self) {
        self.resolve_process_name();
        debug!("pre specialize [{}]", self.label());
        self.escalate(EventFlags::SKIP_FD_CHECK);
        self.app_specialize_pre();
    }

    pub fn specialize_app_post(&self) {
        debug!("post specialize [{}]", self.label());
        self.app_specialize_post();
    }

    pub fn fork_system_server_pre(&self) {
        debug!("pre forkSystemServer");
        self.escalate(EventFlags::SERVER_FORK_AND_SPECIALIZE);

        self.obscure_server_fossil();
        self.fork_pre();
        if self.is_forked_child() {
            self.server_specialize_pre();
        }
        self.sanitize_fds();
    }

    pub fn fork_system_server_post(&self) {
        if self.is_forked_child() {
            debug!("post forkSystemServer");
            self.run_modules_post();
        }
        self.fork_post();
    }

    // =========================================================================
    // FORK AND DESCRIPTORS
    // =========================================================================

    fn fork_pre(&self) {
        let host = self.zygote.host();
        host.set_sigchld_blocked(true);

        let pid = host.fork();
        self.pid.set(Some(pid));
        if pid < 0 {
            error!("fork for [{}] failed: {}", self.label(), std::io::Error::last_os_error());
            return;
        }
        if pid > 0 {
            return;
        }

        // Everything open at fork time belongs to the launcher.
        let mut allowed = self.allowed_fds.borrow_mut();
        for fd in host.open_fds() {
            if !allowed.allow(fd) {
                debug!("closing out-of-range fd {fd}");
                host.close_fd(fd);
            }
        }
    }

    fn fork_post(&self) {
        self.zygote.host().set_sigchld_blocked(false);
    }

    fn can_exempt_fd(&self) -> bool {
        self.flags().contains(EventFlags::APP_FORK_AND_SPECIALIZE)
            && self.app_args().is_some_and(|args| !args.fds_to_ignore.is_null())
    }

    /// Keep `fd` open across specialization.
    ///
    /// Requests after the post boundary, or in an event that never
    /// sanitizes, succeed without effect.
    pub fn exempt_fd(&self, fd: RawFd) -> bool {
        if self.flags().intersects(EventFlags::POST_SPECIALIZE | EventFlags::SKIP_FD_CHECK) {
            return true;
        }
        if !self.can_exempt_fd() {
            return false;
        }
        self.exempted_fds.borrow_mut().push(fd);
        debug!("exempt fd {fd}");
        true
    }

    fn sanitize_fds(&self) {
        if !self.is_forked_child() || self.flags().contains(EventFlags::SKIP_FD_CHECK) {
            return;
        }
        if self.can_exempt_fd() {
            self.merge_exemptions();
        }

        let host = self.zygote.host();
        let allowed = self.allowed_fds.borrow();
        for fd in host.open_fds() {
            if !allowed.contains(fd) {
                debug!("closing fd {fd} opened during specialization");
                host.close_fd(fd);
            }
        }
    }

    /// Fold the launcher's own ignore list and module exemptions into the
    /// allow-list, and hand the enlarged list back to the launcher.
    fn merge_exemptions(&self) {
        let Some(slot) = self.app_args().map(|args| args.fds_to_ignore) else {
            return;
        };
        let exempted = self.exempted_fds.borrow();
        let mut allowed = self.allowed_fds.borrow_mut();

        let current = unsafe { *slot };
        let mut merged = if current.is_null() { Vec::new() } else { self.runtime.int_array(current).unwrap_or_default() };
        for fd in &merged {
            allowed.allow(*fd);
        }
        if exempted.is_empty() {
            return;
        }

        for fd in exempted.iter() {
            if !allowed.allow(*fd) {
                warn!("cannot exempt fd {fd}: outside descriptor range");
            }
        }
        merged.extend(exempted.iter().copied());
        match self.runtime.new_int_array(&merged) {
            Some(array) => unsafe { *slot = array },
            None => warn!("failed to rebuild fds_to_ignore"),
        }
    }

    // =========================================================================
    // SPECIALIZATION
    // =========================================================================

    fn fetch_flags(&self, uid: u32) -> ProcessFlags {
        match self.zygote.daemon().get_process_flags(uid) {
            Ok(flags) => flags,
            Err(e) => {
                warn!("failed to query flags of uid {uid}: {e:#}");
                ProcessFlags::empty()
            }
        }
    }

    /// Nominal uid, or for isolated processes the owner of the app data
    /// directory.
    fn effective_uid(&self) -> u32 {
        let Some(args) = self.app_args() else {
            return 0;
        };
        let uid = read(args.uid).unwrap_or(0) as u32;
        if !(AID_ISOLATED_START..=AID_ISOLATED_END).contains(&uid) {
            return uid;
        }
        let owner = read(args.app_data_dir)
            .and_then(|dir| self.runtime.string(dir))
            .and_then(|dir| self.zygote.host().file_owner(Path::new(&dir)));
        match owner {
            Some(owner) => {
                debug!("isolated uid {uid} resolved to {owner}");
                owner
            }
            None => uid,
        }
    }

    fn revert_zygote_mounts(&self) {
        let mut namespace = self.zygote.namespace();
        if namespace.is_settled() {
            return;
        }
        let uid = self.effective_uid();
        let flags = self.fetch_flags(uid);
        self.info_flags.set(flags);
        namespace.revert(self.zygote.host(), flags);
    }

    fn switch_namespace(&self, kind: MountNamespace) {
        if let Err(e) = mount::update_mount_namespace(self.zygote.daemon(), self.zygote.host(), kind) {
            warn!("[{}] failed to switch to {kind:?} namespace: {e:#}", self.label());
        }
    }

    fn app_specialize_pre(&self) {
        self.escalate(EventFlags::APP_SPECIALIZE);

        let uid = self.effective_uid();
        if self.info_flags().is_empty() {
            self.info_flags.set(self.fetch_flags(uid));
        }
        if self.info_flags().needs_unmount() {
            info!("[{}] is on the denylist", self.label());
            self.escalate(EventFlags::DO_REVERT_UNMOUNT);
        }

        self.run_modules_pre();

        if self.flags().contains(EventFlags::DO_REVERT_UNMOUNT) {
            self.switch_namespace(MountNamespace::Clean);
        }
    }

    fn app_specialize_post(&self) {
        self.run_modules_post();
        if self.info_flags().contains(ProcessFlags::PROCESS_IS_MANAGER) {
            debug!("[{}] is the root manager", self.label());
            self.zygote.host().set_env("ZYGISK_ENABLED", "1");
        }
    }

    fn server_specialize_pre(&self) {
        self.run_modules_pre();
        let daemon = self.zygote.daemon();
        if let Err(e) = daemon.system_server_started() {
            warn!("failed to report system server start: {e:#}");
        }
        if let Err(e) = daemon.cache_mount_namespace(self.zygote.host().pid()) {
            warn!("failed to cache mount namespace: {e:#}");
        }
    }

    fn obscure_server_fossil(&self) {
        for map in self.zygote.hooks().cached_maps() {
            if !(map.has_anon_name(SERVER_FOSSIL_REGION) && map.offset == 0 && map.is_private) {
                continue;
            }
            let hits = unsafe { overwrite_occurrences(&map, SERVER_FOSSIL) };
            if hits > 0 {
                debug!("obscured {hits} fossil string(s) in {}", map.path);
            }
        }
    }

    // =========================================================================
    // MODULES
    // =========================================================================

    fn run_modules_pre(&self) {
        let zygote = self.zygote;
        let images = zygote.daemon().read_modules().unwrap_or_else(|e| {
            warn!("failed to read modules: {e:#}");
            Vec::new()
        });

        {
            let mut modules = self.modules.borrow_mut();
            for (id, image) in images.iter().enumerate() {
                if let Some(lib) = zygote.loader().open(image) {
                    modules.push(Module::new(id, lib.handle, lib.entry));
                }
            }
        }
        drop(images);

        let env = self.runtime.env();
        let mut any_rejected = false;
        {
            let modules = self.modules.borrow();
            for module in modules.iter() {
                module.on_load(env);
                if !module.is_valid() {
                    any_rejected = true;
                    continue;
                }
                match self.args {
                    EventArgs::App(args) => module.pre_app_specialize(args),
                    EventArgs::Server(args) => module.pre_server_specialize(args),
                }
            }
        }

        if any_rejected {
            let mut modules = self.modules.borrow_mut();
            let (kept, rejected): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *modules).into_iter().partition(|m| m.is_valid());
            *modules = kept;
            for module in rejected {
                warn!("module {} did not register a usable API, closing it", module.id());
                zygote.loader().close(module.handle());
            }
        }
    }

    fn run_modules_post(&self) {
        self.escalate(EventFlags::POST_SPECIALIZE);

        {
            let modules = self.modules.borrow();
            for module in modules.iter() {
                match self.args {
                    EventArgs::App(args) => module.post_app_specialize(args),
                    EventArgs::Server(args) => module.post_server_specialize(args),
                }
            }
        }

        let zygote = self.zygote;
        let (total, remaining) = {
            let mut modules = self.modules.borrow_mut();
            let total = modules.len();
            modules.retain(|module| !module.try_unload(zygote.loader()));
            (total, modules.len())
        };

        if total > 0 {
            debug!("modules unloaded: {}/{}", total - remaining, total);
            if remaining == 0 {
                self.scrub_engine_traces();
            }
            zygote.set_spoof_maps(self.flags().contains(EventFlags::APP_SPECIALIZE) && remaining > 0);
        }
    }

    fn scrub_engine_traces(&self) {
        let hooks = self.zygote.hooks();
        let restored = hooks.revert_all();
        let renamed = self.zygote.host().scrub_anon_names();
        hooks.refresh_maps();
        debug!("engine traces scrubbed: {restored} slot(s) restored, {renamed} region(s) renamed");
    }

    /// Number of modules still loaded in this event.
    pub fn module_count(&self) -> usize {
        self.modules.borrow().len()
    }
}

fn read<T: Copy>(ptr: *mut T) -> Option<T> {
    if ptr.is_null() { None } else { Some(unsafe { *ptr }) }
}
