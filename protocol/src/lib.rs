//! Wire types shared between the zygisk loader and its privileged daemon.

pub mod codec;
pub mod error;
pub mod flags;
pub mod platform;
pub mod protocol;

pub use codec::{recv_fd, send_fd, StreamExt};
pub use error::{ProtocolError, Result};
pub use flags::ProcessFlags;
pub use protocol::*;
