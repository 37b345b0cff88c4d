//! Request vocabulary of the daemon socket.

use crate::error::ProtocolError;

// =============================================================================
// ACTIONS
// =============================================================================

/// First byte of every daemon connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DaemonSocketAction {
    PingHeartbeat = 0,
    GetProcessFlags = 1,
    CacheMountNamespace = 2,
    UpdateMountNamespace = 3,
    ReadModules = 4,
    RequestCompanionSocket = 5,
    GetModuleDir = 6,
    ZygoteRestart = 7,
    SystemServerStarted = 8,
}

impl TryFrom<u8> for DaemonSocketAction {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::PingHeartbeat,
            1 => Self::GetProcessFlags,
            2 => Self::CacheMountNamespace,
            3 => Self::UpdateMountNamespace,
            4 => Self::ReadModules,
            5 => Self::RequestCompanionSocket,
            6 => Self::GetModuleDir,
            7 => Self::ZygoteRestart,
            8 => Self::SystemServerStarted,
            other => return Err(ProtocolError::UnknownAction(other)),
        })
    }
}

// =============================================================================
// MOUNT NAMESPACES
// =============================================================================

/// Mount namespaces the daemon keeps cached for switching into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MountNamespace {
    /// Stock mounts, without any root or module overlays.
    Clean = 0,
    /// The namespace holding root and module mounts.
    Root = 1,
}

impl TryFrom<u8> for MountNamespace {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Clean),
            1 => Ok(Self::Root),
            other => Err(ProtocolError::UnknownNamespace(other)),
        }
    }
}
