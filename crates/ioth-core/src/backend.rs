//! Networking stack backend abstraction.
//!
//! A `StackBackend` is one instance of a networking stack: the host
//! kernel, a user-space TCP/IP stack loaded from a plugin, or a test
//! double. The registry forwards every socket primitive on a descriptor
//! to the backend that created that descriptor.
//!
//! # Implementors
//!
//! - `HostStack` (ioth-module): the kernel stack via libc. Native for
//!   every primitive.
//!
//! - `DynStack` (ioth-module): a C plugin table resolved with `dlsym`.
//!   Any slot may be missing.
//!
//! # Minimal implementations
//!
//! Only `name` and `native_ops` are required. Control primitives default
//! to `Unsupported`. Narrow I/O primitives default to the derivations in
//! [`crate::derive`], so a backend that implements `socket`, `close`,
//! `recvmsg` and `sendmsg` exposes the full read/write surface.
//!
//! `native_ops` must list exactly the primitives the implementor
//! overrides. It is informational: dispatch always goes through the
//! methods.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use libc::{c_int, c_long, c_ulong, c_void};

use crate::abi::{Op, OpSet};
use crate::derive;
use crate::error::{IothError, Result};
use crate::msg::{RecvMsg, SendMsg};
use crate::sockaddr::SockAddr;

pub trait StackBackend: Send + Sync {
    /// Backend name, e.g. `"kernel"` or `"vdestack"`.
    fn name(&self) -> &str;

    /// Primitives implemented natively.
    fn native_ops(&self) -> OpSet;

    /// Opaque per-stack context published to the backend's callbacks
    /// while one of its primitives runs. Null for backends that keep no
    /// such state.
    fn stack_data(&self) -> *mut c_void {
        std::ptr::null_mut()
    }

    /// Tear down backend state. Called once, with no sockets open.
    /// On error the stack stays usable.
    fn release(&self) -> Result<()> {
        Ok(())
    }

    // ── Socket lifecycle ──

    fn socket(&self, _domain: c_int, _ty: c_int, _protocol: c_int) -> Result<RawFd> {
        Err(IothError::Unsupported(Op::Socket))
    }

    fn close(&self, _fd: RawFd) -> Result<()> {
        Err(IothError::Unsupported(Op::Close))
    }

    // ── Control path ──

    fn bind(&self, _fd: RawFd, _addr: &SockAddr) -> Result<()> {
        Err(IothError::Unsupported(Op::Bind))
    }

    fn connect(&self, _fd: RawFd, _addr: &SockAddr) -> Result<()> {
        Err(IothError::Unsupported(Op::Connect))
    }

    fn listen(&self, _fd: RawFd, _backlog: c_int) -> Result<()> {
        Err(IothError::Unsupported(Op::Listen))
    }

    /// Accept a connection. The new descriptor belongs to the same stack.
    fn accept(&self, _fd: RawFd, _addr: Option<&mut SockAddr>) -> Result<RawFd> {
        Err(IothError::Unsupported(Op::Accept))
    }

    fn getsockname(&self, _fd: RawFd, _addr: &mut SockAddr) -> Result<()> {
        Err(IothError::Unsupported(Op::Getsockname))
    }

    fn getpeername(&self, _fd: RawFd, _addr: &mut SockAddr) -> Result<()> {
        Err(IothError::Unsupported(Op::Getpeername))
    }

    fn setsockopt(&self, _fd: RawFd, _level: c_int, _name: c_int, _value: &[u8]) -> Result<()> {
        Err(IothError::Unsupported(Op::Setsockopt))
    }

    /// Returns the option length written into `value`.
    fn getsockopt(
        &self,
        _fd: RawFd,
        _level: c_int,
        _name: c_int,
        _value: &mut [u8],
    ) -> Result<usize> {
        Err(IothError::Unsupported(Op::Getsockopt))
    }

    fn shutdown(&self, _fd: RawFd, _how: c_int) -> Result<()> {
        Err(IothError::Unsupported(Op::Shutdown))
    }

    /// # Safety
    /// `arg` must be valid for whatever `request` reads or writes.
    unsafe fn ioctl(&self, _fd: RawFd, _request: c_ulong, _arg: *mut c_void) -> Result<c_int> {
        Err(IothError::Unsupported(Op::Ioctl))
    }

    /// Integer-argument `fcntl` commands only (`F_GETFL`, `F_SETFL`, …).
    fn fcntl(&self, _fd: RawFd, _cmd: c_int, _arg: c_long) -> Result<c_int> {
        Err(IothError::Unsupported(Op::Fcntl))
    }

    // ── Read side ──

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        derive::read(self, fd, buf)
    }

    fn readv(&self, fd: RawFd, iov: &mut [IoSliceMut<'_>]) -> Result<usize> {
        derive::readv(self, fd, iov)
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
        derive::recv(self, fd, buf, flags)
    }

    fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: c_int,
        from: Option<&mut SockAddr>,
    ) -> Result<usize> {
        derive::recvfrom(self, fd, buf, flags, from)
    }

    fn recvmsg(&self, _fd: RawFd, _msg: &mut RecvMsg<'_, '_>, _flags: c_int) -> Result<usize> {
        Err(IothError::Unsupported(Op::Recvmsg))
    }

    // ── Write side ──

    fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        derive::write(self, fd, buf)
    }

    fn writev(&self, fd: RawFd, iov: &[IoSlice<'_>]) -> Result<usize> {
        derive::writev(self, fd, iov)
    }

    fn send(&self, fd: RawFd, buf: &[u8], flags: c_int) -> Result<usize> {
        derive::send(self, fd, buf, flags)
    }

    fn sendto(&self, fd: RawFd, buf: &[u8], flags: c_int, to: Option<&SockAddr>) -> Result<usize> {
        derive::sendto(self, fd, buf, flags, to)
    }

    fn sendmsg(&self, _fd: RawFd, _msg: &SendMsg<'_, '_>, _flags: c_int) -> Result<usize> {
        Err(IothError::Unsupported(Op::Sendmsg))
    }
}
