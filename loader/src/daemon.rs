//! Client side of the privileged daemon.
//!
//! Each request opens a fresh connection, sends a one-byte action code and
//! its payload, then reads the reply. The daemon sees the connection's peer
//! credentials, which is why no identity travels in the payload.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use log::trace;
use zygisk_protocol::{recv_fd, DaemonSocketAction, MountNamespace, ProcessFlags, StreamExt};

/// A module library image handed over by the daemon as an open descriptor.
#[derive(Debug)]
pub struct ModuleImage {
    pub name: String,
    pub fd: OwnedFd,
}

/// Everything the engine asks of the privileged service.
pub trait Daemon: Send + Sync {
    fn read_modules(&self) -> Result<Vec<ModuleImage>>;

    fn get_process_flags(&self, uid: u32) -> Result<ProcessFlags>;

    /// Open the companion channel of module `id`.
    fn connect_companion(&self, id: usize) -> Result<OwnedFd>;

    fn get_module_dir(&self, id: usize) -> Result<OwnedFd>;

    fn system_server_started(&self) -> Result<()>;

    fn cache_mount_namespace(&self, pid: u32) -> Result<()>;

    /// Path of a descriptor for the requested namespace, of the form
    /// `/proc/<pid>/fd/<fd>`.
    fn update_mount_namespace(&self, kind: MountNamespace) -> Result<String>;
}

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect(&self, action: DaemonSocketAction) -> Result<UnixStream> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("connect to {}", self.socket_path.display()))?;
        stream.write_u8(action as u8)?;
        trace!("daemon request {:?}", action);
        Ok(stream)
    }

    /// Check the daemon is reachable.
    pub fn ping(&self) -> Result<()> {
        self.connect(DaemonSocketAction::PingHeartbeat).map(drop)
    }
}

impl Daemon for DaemonClient {
    fn read_modules(&self) -> Result<Vec<ModuleImage>> {
        let mut stream = self.connect(DaemonSocketAction::ReadModules)?;
        let count = stream.read_usize()?;
        let mut modules = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = stream.read_string()?;
            let fd = recv_fd(&stream).with_context(|| format!("receive image of {name}"))?;
            modules.push(ModuleImage { name, fd });
        }
        Ok(modules)
    }

    fn get_process_flags(&self, uid: u32) -> Result<ProcessFlags> {
        let mut stream = self.connect(DaemonSocketAction::GetProcessFlags)?;
        stream.write_u32(uid)?;
        Ok(ProcessFlags::from_bits_retain(stream.read_u32()?))
    }

    fn connect_companion(&self, id: usize) -> Result<OwnedFd> {
        let mut stream = self.connect(DaemonSocketAction::RequestCompanionSocket)?;
        stream.write_usize(id)?;
        if stream.read_u8()? == 0 {
            bail!("no companion for module {id}");
        }
        Ok(OwnedFd::from(stream))
    }

    fn get_module_dir(&self, id: usize) -> Result<OwnedFd> {
        let mut stream = self.connect(DaemonSocketAction::GetModuleDir)?;
        stream.write_usize(id)?;
        Ok(recv_fd(&stream)?)
    }

    fn system_server_started(&self) -> Result<()> {
        self.connect(DaemonSocketAction::SystemServerStarted).map(drop)
    }

    fn cache_mount_namespace(&self, pid: u32) -> Result<()> {
        let mut stream = self.connect(DaemonSocketAction::CacheMountNamespace)?;
        stream.write_u32(pid)?;
        Ok(())
    }

    fn update_mount_namespace(&self, kind: MountNamespace) -> Result<String> {
        let mut stream = self.connect(DaemonSocketAction::UpdateMountNamespace)?;
        stream.write_u8(kind as u8)?;
        let pid = stream.read_u32()?;
        let fd = stream.read_u32()?;
        if pid == 0 {
            bail!("daemon has no {kind:?} namespace cached");
        }
        Ok(format!("/proc/{pid}/fd/{fd}"))
    }
}
