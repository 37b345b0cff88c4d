//! Mount-namespace control.
//!
//! The zygote inherits mounts made by the root implementation and its
//! modules. Before the first application fork those mounts are detached
//! from the zygote's own namespace (once, retrying only failures), and
//! individual processes can be switched to a namespace cached by the
//! daemon.

use std::io::Cursor;

use anyhow::{bail, Result};
use log::{debug, info, warn};
use procfs_core::process::{MountInfo, MountInfos};
use procfs_core::FromBufRead;
use zygisk_protocol::{MountNamespace, ProcessFlags};

use crate::daemon::Daemon;
use crate::host::Host;

/// A mount introduced by the root implementation or its modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTrace {
    pub target: String,
    pub id: i32,
    /// Diagnostic rendering of the mountinfo entry.
    pub raw_info: String,
}

impl MountTrace {
    fn from_info(info: &MountInfo) -> Self {
        let target = info.mount_point.to_string_lossy().into_owned();
        let raw_info = format!(
            "{} {} {} {} {}",
            info.mnt_id,
            info.root,
            target,
            info.fs_type,
            info.mount_source.as_deref().unwrap_or("none"),
        );
        Self { target, id: info.mnt_id, raw_info }
    }
}

/// Mounts in `mountinfo` that belong to the root implementation, ordered by
/// descending mount id so nested mounts are detached before their parents.
pub fn discover_traces(mountinfo: &str, flags: ProcessFlags) -> Vec<MountTrace> {
    let infos = match MountInfos::from_buf_read(Cursor::new(mountinfo.as_bytes())) {
        Ok(infos) => infos.0,
        Err(e) => {
            warn!("failed to parse mountinfo: {e}");
            return Vec::new();
        }
    };
    let source = flags.root_source();

    let mut traces: Vec<MountTrace> = infos
        .iter()
        .filter(|info| {
            let target = info.mount_point.to_string_lossy();
            info.root.starts_with("/adb/modules")
                || target.starts_with("/data/adb/modules")
                || (source.is_some() && info.mount_source.as_deref() == source)
        })
        .map(MountTrace::from_info)
        .collect();
    traces.sort_by_key(|t| std::cmp::Reverse(t.id));
    traces
}

/// Whether reverting `traces` must be skipped.
///
/// An empty set always aborts. A `/product` target aborts on its own
/// (anything under `/product/bin` never does); with magic mount, anything
/// under `/product` aborts.
pub fn should_abort_unmount(traces: &[MountTrace], flags: ProcessFlags) -> bool {
    if traces.is_empty() {
        return true;
    }
    let magic_mount = flags.contains(ProcessFlags::PROCESS_ROOT_IS_MAGISK);
    traces.iter().any(|trace| {
        let target = trace.target.as_str();
        if !target.starts_with("/product") || target.starts_with("/product/bin") {
            return false;
        }
        magic_mount || target == "/product"
    })
}

/// What a revert call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertOutcome {
    /// Already settled by an earlier call.
    Settled,
    /// The abort rule matched; nothing was detached.
    Aborted,
    Attempted { unmounted: usize, failed: usize },
}

/// One-shot bookkeeping for detaching the zygote's root mounts.
#[derive(Debug, Default)]
pub struct NamespaceController {
    traces: Vec<MountTrace>,
    attempted: bool,
}

impl NamespaceController {
    pub fn traces(&self) -> &[MountTrace] {
        &self.traces
    }

    pub fn attempted(&self) -> bool {
        self.attempted
    }

    /// True once an attempt was made and nothing is left to retry.
    pub fn is_settled(&self) -> bool {
        self.attempted && self.traces.is_empty()
    }

    /// Detach the zygote's root mounts.
    ///
    /// The first call discovers traces and applies the abort rule; an
    /// aborted set is kept so the next call evaluates it again. After an
    /// attempt only the mounts that failed to detach are retried.
    pub fn revert(&mut self, host: &dyn Host, flags: ProcessFlags) -> RevertOutcome {
        if self.is_settled() {
            return RevertOutcome::Settled;
        }

        if !self.attempted {
            if self.traces.is_empty() {
                match host.mount_info() {
                    Ok(text) => self.traces = discover_traces(&text, flags),
                    Err(e) => warn!("failed to read mountinfo: {e}"),
                }
            }
            if should_abort_unmount(&self.traces, flags) {
                debug!("skip unmounting zygote ({} traces)", self.traces.len());
                return RevertOutcome::Aborted;
            }
        }

        let before = self.traces.len();
        self.traces.retain(|trace| {
            debug!("unmounting {} (mnt_id: {})", trace.target, trace.id);
            match host.lazy_unmount(&trace.target) {
                Ok(()) => false,
                Err(e) => {
                    warn!("failed to unmount {}: {e} [{}]", trace.target, trace.raw_info);
                    true
                }
            }
        });
        self.attempted = true;

        let failed = self.traces.len();
        info!("zygote unmount: {}/{} detached", before - failed, before);
        RevertOutcome::Attempted { unmounted: before - failed, failed }
    }
}

/// Switch the calling process into the namespace `kind` cached by the
/// daemon.
pub fn update_mount_namespace(daemon: &dyn Daemon, host: &dyn Host, kind: MountNamespace) -> Result<()> {
    let path = daemon.update_mount_namespace(kind)?;
    if !path.starts_with("/proc/") {
        bail!("refusing namespace path {path:?}");
    }
    host.join_mount_namespace(&path)?;
    debug!("switched to {kind:?} namespace via {path}");
    Ok(())
}
