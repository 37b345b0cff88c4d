//! Stream codec for daemon connections.
//!
//! Integers travel in native byte order (both ends run on the same device),
//! strings as a `usize` length followed by UTF-8 bytes, and file descriptors
//! as `SCM_RIGHTS` ancillary data attached to a single filler byte.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::{ProtocolError, Result};
use crate::platform::MAX_FRAME_LEN;

/// Typed reads and writes on any byte stream.
pub trait StreamExt: Read + Write {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn read_usize(&mut self) -> Result<usize> {
        let mut buf = [0u8; core::mem::size_of::<usize>()];
        self.read_exact(&mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_usize()?;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::Oversized(len));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])?;
        Ok(())
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn write_usize(&mut self, value: usize) -> Result<()> {
        self.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_usize(value.len())?;
        self.write_all(value.as_bytes())?;
        Ok(())
    }
}

impl<T: Read + Write + ?Sized> StreamExt for T {}

/// Control buffer large enough for one descriptor, aligned for `cmsghdr`.
#[repr(C, align(8))]
struct ControlBuf([u8; 64]);

/// Send `fd` over `stream` as ancillary data.
pub fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<()> {
    let mut filler = [0u8; 1];
    let mut iov = libc::iovec { iov_base: filler.as_mut_ptr().cast(), iov_len: filler.len() };
    let mut control = ControlBuf([0u8; 64]);
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(core::mem::size_of::<RawFd>() as u32) } as usize;

    // SAFETY: msghdr is plain old data; every pointer set below outlives the
    // sendmsg call.
    let rc = unsafe {
        let mut msg: libc::msghdr = core::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(ProtocolError::MissingDescriptor);
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(core::mem::size_of::<RawFd>() as u32) as _;
        core::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);

        libc::sendmsg(stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL)
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Receive one descriptor sent with [`send_fd`].
pub fn recv_fd(stream: &UnixStream) -> Result<OwnedFd> {
    let mut filler = [0u8; 1];
    let mut iov = libc::iovec { iov_base: filler.as_mut_ptr().cast(), iov_len: filler.len() };
    let mut control = ControlBuf([0u8; 64]);
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(core::mem::size_of::<RawFd>() as u32) } as usize;

    // SAFETY: as in send_fd; the kernel writes at most msg_controllen bytes.
    unsafe {
        let mut msg: libc::msghdr = core::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let received = libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_WAITALL);
        if received < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() || (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(ProtocolError::MissingDescriptor);
        }
        let fd = core::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
        if fd < 0 {
            return Err(ProtocolError::MissingDescriptor);
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}
