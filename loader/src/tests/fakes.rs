//! In-memory stand-ins for the engine's collaborators, and scripted test
//! modules that drive the capability table the way a real module would.

use core::ffi::{c_int, c_long, c_void};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use zygisk_intercept::MapInfo;
use zygisk_protocol::{MountNamespace, ProcessFlags};

use crate::api::{ApiTable, AppSpecializeArgs, ModuleAbi, ServerSpecializeArgs, ZygiskOption};
use crate::daemon::{Daemon, ModuleImage};
use crate::dl::{LoadedLibrary, ModuleLoader};
use crate::hook::PatchBackend;
use crate::host::Host;
use crate::jni::{jboolean, jint, jintArray, jstring, JNIEnv, Runtime};
use crate::entry;
use crate::zygote::Zygote;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

// =============================================================================
// DAEMON
// =============================================================================

#[derive(Default)]
pub struct DaemonState {
    pub flags: Mutex<HashMap<u32, ProcessFlags>>,
    pub modules: Mutex<Vec<String>>,
    pub namespace_path: Mutex<Option<String>>,
    pub calls: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct FakeDaemon(pub Arc<DaemonState>);

impl FakeDaemon {
    pub fn set_flags(&self, uid: u32, flags: ProcessFlags) {
        lock(&self.0.flags).insert(uid, flags);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.0.calls).clone()
    }

    fn record(&self, call: String) {
        lock(&self.0.calls).push(call);
    }
}

impl Daemon for FakeDaemon {
    fn read_modules(&self) -> Result<Vec<ModuleImage>> {
        self.record("read_modules".into());
        lock(&self.0.modules)
            .iter()
            .map(|name| -> Result<ModuleImage> {
                Ok(ModuleImage { name: name.clone(), fd: OwnedFd::from(tempfile::tempfile()?) })
            })
            .collect()
    }

    fn get_process_flags(&self, uid: u32) -> Result<ProcessFlags> {
        self.record(format!("flags:{uid}"));
        Ok(lock(&self.0.flags).get(&uid).copied().unwrap_or_default())
    }

    fn connect_companion(&self, id: usize) -> Result<OwnedFd> {
        self.record(format!("companion:{id}"));
        Ok(OwnedFd::from(tempfile::tempfile()?))
    }

    fn get_module_dir(&self, id: usize) -> Result<OwnedFd> {
        self.record(format!("module_dir:{id}"));
        bail!("no directory for module {id}")
    }

    fn system_server_started(&self) -> Result<()> {
        self.record("system_server_started".into());
        Ok(())
    }

    fn cache_mount_namespace(&self, pid: u32) -> Result<()> {
        self.record(format!("cache_ns:{pid}"));
        Ok(())
    }

    fn update_mount_namespace(&self, kind: MountNamespace) -> Result<String> {
        self.record(format!("update_ns:{kind:?}"));
        match lock(&self.0.namespace_path).clone() {
            Some(path) => Ok(path),
            None => bail!("no namespace"),
        }
    }
}

// =============================================================================
// LOADER
// =============================================================================

#[derive(Default)]
pub struct LoaderState {
    pub next_handle: AtomicUsize,
    pub opened: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<usize>>,
}

#[derive(Clone, Default)]
pub struct FakeLoader(pub Arc<LoaderState>);

impl FakeLoader {
    pub fn closed(&self) -> Vec<usize> {
        lock(&self.0.closed).clone()
    }
}

impl ModuleLoader for FakeLoader {
    fn open(&self, image: &ModuleImage) -> Option<LoadedLibrary> {
        lock(&self.0.opened).push(image.name.clone());
        let handle = self.0.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        Some(LoadedLibrary { handle: handle as *mut c_void, entry: test_module_entry })
    }

    fn close(&self, handle: *mut c_void) -> bool {
        lock(&self.0.closed).push(handle as usize);
        true
    }
}

// =============================================================================
// HOST
// =============================================================================

pub struct HostState {
    pub fork_pid: Mutex<libc::pid_t>,
    pub fds: Mutex<BTreeSet<RawFd>>,
    pub closed: Mutex<Vec<RawFd>>,
    pub sigchld: Mutex<Vec<bool>>,
    pub mountinfo: Mutex<String>,
    pub failing_unmounts: Mutex<HashSet<String>>,
    pub unmounted: Mutex<Vec<String>>,
    pub joined: Mutex<Vec<String>>,
    pub env: Mutex<Vec<(String, String)>>,
    pub owners: Mutex<HashMap<PathBuf, u32>>,
    pub scrubs: AtomicUsize,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            fork_pid: Mutex::new(0),
            fds: Mutex::new([0, 1, 2].into_iter().collect()),
            closed: Mutex::default(),
            sigchld: Mutex::default(),
            mountinfo: Mutex::default(),
            failing_unmounts: Mutex::default(),
            unmounted: Mutex::default(),
            joined: Mutex::default(),
            env: Mutex::default(),
            owners: Mutex::default(),
            scrubs: AtomicUsize::new(0),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeHost(pub Arc<HostState>);

impl FakeHost {
    pub fn set_fork_pid(&self, pid: libc::pid_t) {
        *lock(&self.0.fork_pid) = pid;
    }

    /// Simulate a descriptor being opened.
    pub fn open(&self, fd: RawFd) {
        lock(&self.0.fds).insert(fd);
    }

    pub fn is_open(&self, fd: RawFd) -> bool {
        lock(&self.0.fds).contains(&fd)
    }

    pub fn closed(&self) -> Vec<RawFd> {
        lock(&self.0.closed).clone()
    }

    pub fn sigchld(&self) -> Vec<bool> {
        lock(&self.0.sigchld).clone()
    }

    pub fn set_mountinfo(&self, text: &str) {
        *lock(&self.0.mountinfo) = text.to_string();
    }

    pub fn fail_unmount(&self, target: &str, fail: bool) {
        let mut failing = lock(&self.0.failing_unmounts);
        if fail {
            failing.insert(target.to_string());
        } else {
            failing.remove(target);
        }
    }

    pub fn unmounted(&self) -> Vec<String> {
        lock(&self.0.unmounted).clone()
    }

    pub fn joined(&self) -> Vec<String> {
        lock(&self.0.joined).clone()
    }

    pub fn env(&self) -> Vec<(String, String)> {
        lock(&self.0.env).clone()
    }

    pub fn set_owner(&self, path: &str, uid: u32) {
        lock(&self.0.owners).insert(PathBuf::from(path), uid);
    }

    pub fn scrubs(&self) -> usize {
        self.0.scrubs.load(Ordering::SeqCst)
    }
}

impl Host for FakeHost {
    fn fork(&self) -> libc::pid_t {
        *lock(&self.0.fork_pid)
    }

    fn set_sigchld_blocked(&self, blocked: bool) {
        lock(&self.0.sigchld).push(blocked);
    }

    fn open_fds(&self) -> Vec<RawFd> {
        lock(&self.0.fds).iter().copied().collect()
    }

    fn close_fd(&self, fd: RawFd) {
        lock(&self.0.fds).remove(&fd);
        lock(&self.0.closed).push(fd);
    }

    fn fd_limit(&self) -> usize {
        1024
    }

    fn file_owner(&self, path: &Path) -> Option<u32> {
        lock(&self.0.owners).get(path).copied()
    }

    fn mount_info(&self) -> io::Result<String> {
        Ok(lock(&self.0.mountinfo).clone())
    }

    fn lazy_unmount(&self, target: &str) -> io::Result<()> {
        if lock(&self.0.failing_unmounts).contains(target) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        lock(&self.0.unmounted).push(target.to_string());
        Ok(())
    }

    fn join_mount_namespace(&self, path: &str) -> io::Result<()> {
        lock(&self.0.joined).push(path.to_string());
        Ok(())
    }

    fn scrub_anon_names(&self) -> usize {
        self.0.scrubs.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn set_env(&self, key: &str, value: &str) {
        lock(&self.0.env).push((key.to_string(), value.to_string()));
    }

    fn pid(&self) -> u32 {
        4242
    }
}

// =============================================================================
// PATCH BACKEND
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub dev: u64,
    pub inode: u64,
    pub symbol: String,
    pub replacement: usize,
}

#[derive(Default)]
pub struct BackendState {
    pub maps: Mutex<Vec<MapInfo>>,
    pub registered: Mutex<Vec<Registered>>,
    pub commits: AtomicUsize,
    pub reverts: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeBackend(pub Arc<BackendState>);

impl FakeBackend {
    pub fn with_maps(text: &str) -> Self {
        let backend = Self::default();
        *lock(&backend.0.maps) = MapInfo::parse(text);
        backend
    }

    pub fn registered(&self) -> Vec<Registered> {
        lock(&self.0.registered).clone()
    }

    pub fn commits(&self) -> usize {
        self.0.commits.load(Ordering::SeqCst)
    }

    pub fn reverts(&self) -> usize {
        self.0.reverts.load(Ordering::SeqCst)
    }
}

impl PatchBackend for FakeBackend {
    fn register(&self, dev: u64, inode: u64, symbol: &str, replacement: *mut c_void, _backup: *mut *mut c_void) -> bool {
        lock(&self.0.registered).push(Registered { dev, inode, symbol: symbol.to_string(), replacement: replacement as usize });
        true
    }

    fn commit(&self, _maps: &[MapInfo]) -> bool {
        self.0.commits.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn revert_all(&self, _maps: &[MapInfo]) -> usize {
        self.0.reverts.fetch_add(1, Ordering::SeqCst);
        lock(&self.0.registered).len()
    }

    fn snapshot(&self) -> Vec<MapInfo> {
        lock(&self.0.maps).clone()
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

/// Strings and int arrays addressed by fake handles.
#[derive(Default)]
pub struct FakeRuntime {
    strings: RefCell<HashMap<usize, String>>,
    arrays: RefCell<HashMap<usize, Vec<jint>>>,
    next: Cell<usize>,
}

impl FakeRuntime {
    fn handle(&self) -> usize {
        self.next.set(self.next.get() + 8);
        0x1000 + self.next.get()
    }

    pub fn new_string(&self, value: &str) -> jstring {
        let handle = self.handle();
        self.strings.borrow_mut().insert(handle, value.to_string());
        handle as jstring
    }

    pub fn int_array_of(&self, values: &[jint]) -> jintArray {
        let handle = self.handle();
        self.arrays.borrow_mut().insert(handle, values.to_vec());
        handle as jintArray
    }

    pub fn array(&self, array: jintArray) -> Option<Vec<jint>> {
        self.arrays.borrow().get(&(array as usize)).cloned()
    }
}

impl Runtime for FakeRuntime {
    fn env(&self) -> *mut JNIEnv {
        core::ptr::null_mut()
    }

    fn string(&self, value: jstring) -> Option<String> {
        self.strings.borrow().get(&(value as usize)).cloned()
    }

    fn int_array(&self, array: jintArray) -> Option<Vec<jint>> {
        self.array(array)
    }

    fn new_int_array(&self, values: &[jint]) -> Option<jintArray> {
        Some(self.int_array_of(values))
    }
}

// =============================================================================
// ARGUMENTS
// =============================================================================

/// Backing storage for [`AppSpecializeArgs`]. Boxed so the pointers stay
/// valid.
pub struct AppArgs {
    pub uid: jint,
    pub gid: jint,
    pub nice_name: jstring,
    pub app_data_dir: jstring,
    pub fds_to_ignore: jintArray,
    pub is_child_zygote: jboolean,
    pub raw: AppSpecializeArgs,
}

impl AppArgs {
    pub fn new(runtime: &FakeRuntime, uid: jint, name: &str) -> Box<AppArgs> {
        let mut args = Box::new(AppArgs {
            uid,
            gid: uid,
            nice_name: runtime.new_string(name),
            app_data_dir: runtime.new_string(&format!("/data/user/0/{name}")),
            fds_to_ignore: core::ptr::null_mut(),
            is_child_zygote: 0,
            // SAFETY: all-null is a valid value for a struct of raw pointers.
            raw: unsafe { core::mem::zeroed() },
        });
        args.raw.uid = &mut args.uid;
        args.raw.gid = &mut args.gid;
        args.raw.nice_name = &mut args.nice_name;
        args.raw.app_data_dir = &mut args.app_data_dir;
        args.raw.fds_to_ignore = &mut args.fds_to_ignore;
        args.raw.is_child_zygote = &mut args.is_child_zygote;
        args
    }
}

pub struct ServerArgs {
    pub uid: jint,
    pub raw: ServerSpecializeArgs,
}

impl ServerArgs {
    pub fn new() -> Box<ServerArgs> {
        let mut args = Box::new(ServerArgs { uid: 1000, raw: unsafe { core::mem::zeroed() } });
        args.raw.uid = &mut args.uid;
        args
    }
}

// =============================================================================
// SCRIPTED MODULES
// =============================================================================

pub type Script = Box<dyn Fn(&ModuleHandle, *mut c_void)>;

/// Behaviour of one test module, consumed by the next module entry call.
pub struct TestModule {
    pub name: &'static str,
    pub version: c_long,
    pub register: bool,
    pub pre: Option<Script>,
    pub post: Option<Script>,
}

impl TestModule {
    pub fn new(name: &'static str, version: c_long) -> Self {
        Self { name, version, register: true, pre: None, post: None }
    }

    pub fn unregistered(name: &'static str) -> Self {
        Self { register: false, ..Self::new(name, 5) }
    }

    pub fn on_pre(mut self, f: impl Fn(&ModuleHandle, *mut c_void) + 'static) -> Self {
        self.pre = Some(Box::new(f));
        self
    }

    pub fn on_post(mut self, f: impl Fn(&ModuleHandle, *mut c_void) + 'static) -> Self {
        self.post = Some(Box::new(f));
        self
    }
}

/// What a module sees of itself: its name and the engine's table.
pub struct ModuleHandle {
    behaviour: TestModule,
    api: *mut ApiTable,
}

impl ModuleHandle {
    pub fn name(&self) -> &'static str {
        self.behaviour.name
    }

    fn is_v4(&self) -> bool {
        self.behaviour.version >= 4
    }

    pub fn set_option(&self, option: ZygiskOption) {
        let api = unsafe { &*self.api };
        let f = unsafe { if self.is_v4() { api.caps.v4.set_option } else { api.caps.v1.set_option } };
        unsafe { f.unwrap()(api.impl_, option as c_int) };
    }

    pub fn exempt_fd(&self, fd: RawFd) -> bool {
        let api = unsafe { &*self.api };
        unsafe { api.caps.v4.exempt_fd.unwrap()(fd) }
    }

    pub fn get_flags(&self) -> u32 {
        let api = unsafe { &*self.api };
        let f = unsafe { if self.is_v4() { api.caps.v4.get_flags } else { api.caps.v1.get_flags } };
        unsafe { f.unwrap()(api.impl_) }
    }

    pub fn connect_companion(&self) -> c_int {
        let api = unsafe { &*self.api };
        let f = unsafe { if self.is_v4() { api.caps.v4.connect_companion } else { api.caps.v1.connect_companion } };
        unsafe { f.unwrap()(api.impl_) }
    }
}

thread_local! {
    static QUEUE: RefCell<VecDeque<TestModule>> = const { RefCell::new(VecDeque::new()) };
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Queue scripts for the modules loaded next on this thread.
pub fn queue_modules(modules: Vec<TestModule>) {
    QUEUE.with(|q| q.borrow_mut().extend(modules));
}

pub fn record(event: String) {
    EVENTS.with(|e| e.borrow_mut().push(event));
}

pub fn take_events() -> Vec<String> {
    EVENTS.with(|e| std::mem::take(&mut *e.borrow_mut()))
}

unsafe fn handle<'a>(impl_: *mut c_void) -> &'a ModuleHandle {
    unsafe { &*(impl_ as *const ModuleHandle) }
}

unsafe extern "C" fn pre_app(impl_: *mut c_void, args: *mut c_void) {
    let module = unsafe { handle(impl_) };
    record(format!("{}:pre_app", module.name()));
    if let Some(script) = &module.behaviour.pre {
        script(module, args);
    }
}

unsafe extern "C" fn post_app(impl_: *mut c_void, args: *mut c_void) {
    let module = unsafe { handle(impl_) };
    record(format!("{}:post_app", module.name()));
    if let Some(script) = &module.behaviour.post {
        script(module, args);
    }
}

unsafe extern "C" fn pre_server(impl_: *mut c_void, args: *mut ServerSpecializeArgs) {
    let module = unsafe { handle(impl_) };
    record(format!("{}:pre_server", module.name()));
    if let Some(script) = &module.behaviour.pre {
        script(module, args.cast());
    }
}

unsafe extern "C" fn post_server(impl_: *mut c_void, args: *mut ServerSpecializeArgs) {
    let module = unsafe { handle(impl_) };
    record(format!("{}:post_server", module.name()));
    if let Some(script) = &module.behaviour.post {
        script(module, args.cast());
    }
}

/// Entry point of every library the fake loader opens.
pub unsafe extern "C" fn test_module_entry(api: *mut ApiTable, _env: *mut JNIEnv) {
    let Some(behaviour) = QUEUE.with(|q| q.borrow_mut().pop_front()) else {
        record("unscripted:load".into());
        return;
    };
    record(format!("{}:load", behaviour.name));

    let register = behaviour.register;
    let version = behaviour.version;
    let module = Box::leak(Box::new(ModuleHandle { behaviour, api }));
    let abi = Box::leak(Box::new(ModuleAbi {
        api_version: version,
        impl_: module as *mut ModuleHandle as *mut c_void,
        pre_app_specialize: Some(pre_app),
        post_app_specialize: Some(post_app),
        pre_server_specialize: Some(pre_server),
        post_server_specialize: Some(post_server),
    }));
    if register {
        let ok = unsafe { (*api).register_module.unwrap()(api, abi) };
        record(format!("{}:registered={ok}", module.name()));
    }
}

// =============================================================================
// FIXTURE
// =============================================================================

/// A [`Zygote`] wired to fakes, with handles kept for inspection.
pub struct Fixture {
    pub daemon: FakeDaemon,
    pub loader: FakeLoader,
    pub host: FakeHost,
    pub backend: FakeBackend,
    pub runtime: FakeRuntime,
    pub zygote: Zygote,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(fd_capacity: usize) -> Self {
        let daemon = FakeDaemon::default();
        *lock(&daemon.0.namespace_path) = Some("/proc/1/fd/5".into());
        take_events();

        let loader = FakeLoader::default();
        let host = FakeHost::default();
        let backend = FakeBackend::default();
        let zygote = Zygote::new(
            Box::new(daemon.clone()),
            Box::new(loader.clone()),
            Box::new(host.clone()),
            Box::new(backend.clone()),
            fd_capacity,
        );
        Self { daemon, loader, host, backend, runtime: FakeRuntime::default(), zygote }
    }

    /// Make the daemon hand out one image per script, in order.
    pub fn install(&self, modules: Vec<TestModule>) {
        *lock(&self.daemon.0.modules) = modules.iter().map(|m| m.name.to_string()).collect();
        queue_modules(modules);
    }

    /// Run `nativeForkAndSpecialize` whose body forks through the hooked
    /// `fork`.
    pub fn fork_app(&self, args: &mut AppArgs) -> libc::pid_t {
        entry::fork_and_specialize(&self.zygote, &self.runtime, &mut args.raw, || entry::fork_replacement())
    }
}
