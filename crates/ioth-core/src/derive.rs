//! Fallback derivation algebra.
//!
//! Each function synthesizes one narrow I/O primitive from the next more
//! general one, translating arguments losslessly:
//!
//! | primitive  | derived from                                  |
//! |------------|-----------------------------------------------|
//! | `read`     | `recv(flags = 0)`                             |
//! | `readv`    | `recvmsg` (vector, no name/control, flags 0)  |
//! | `recv`     | `recvfrom(from = None)`                       |
//! | `recvfrom` | `recvmsg` (one-slice vector, name = `from`)   |
//! | `write`    | `send(flags = 0)`                             |
//! | `writev`   | `sendmsg` (vector, no name/control, flags 0)  |
//! | `send`     | `sendto(to = None)`                           |
//! | `sendto`   | `sendmsg` (one-slice vector, name = `to`)     |
//!
//! `recvmsg` and `sendmsg` are terminal. These are the default method
//! bodies of [`StackBackend`], and the unbound-slot path of adapters
//! that wrap sparse C tables, so both share one definition.
//!
//! An `Unsupported` error raised further down the chain is surfaced under
//! the primitive the caller asked for.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use crate::abi::Op;
use crate::backend::StackBackend;
use crate::error::Result;
use crate::msg::{RecvMsg, SendMsg};
use crate::sockaddr::SockAddr;

// ── Read side ──

pub fn read<B: StackBackend + ?Sized>(b: &B, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    b.recv(fd, buf, 0).map_err(|e| e.surface_as(Op::Read))
}

pub fn readv<B: StackBackend + ?Sized>(
    b: &B,
    fd: RawFd,
    iov: &mut [IoSliceMut<'_>],
) -> Result<usize> {
    let mut msg = RecvMsg::new(iov);
    b.recvmsg(fd, &mut msg, 0).map_err(|e| e.surface_as(Op::Readv))
}

pub fn recv<B: StackBackend + ?Sized>(
    b: &B,
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
) -> Result<usize> {
    b.recvfrom(fd, buf, flags, None)
        .map_err(|e| e.surface_as(Op::Recv))
}

/// The name length the message primitive reports is left in `from`,
/// which is the `*fromlen` write-back of the Berkeley call.
pub fn recvfrom<B: StackBackend + ?Sized>(
    b: &B,
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    from: Option<&mut SockAddr>,
) -> Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut msg = RecvMsg::new(&mut iov).with_name(from);
    b.recvmsg(fd, &mut msg, flags)
        .map_err(|e| e.surface_as(Op::Recvfrom))
}

// ── Write side ──

pub fn write<B: StackBackend + ?Sized>(b: &B, fd: RawFd, buf: &[u8]) -> Result<usize> {
    b.send(fd, buf, 0).map_err(|e| e.surface_as(Op::Write))
}

pub fn writev<B: StackBackend + ?Sized>(
    b: &B,
    fd: RawFd,
    iov: &[IoSlice<'_>],
) -> Result<usize> {
    let msg = SendMsg::new(iov);
    b.sendmsg(fd, &msg, 0).map_err(|e| e.surface_as(Op::Writev))
}

pub fn send<B: StackBackend + ?Sized>(
    b: &B,
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
) -> Result<usize> {
    b.sendto(fd, buf, flags, None)
        .map_err(|e| e.surface_as(Op::Send))
}

pub fn sendto<B: StackBackend + ?Sized>(
    b: &B,
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    to: Option<&SockAddr>,
) -> Result<usize> {
    let iov = [IoSlice::new(buf)];
    let msg = SendMsg::new(&iov).with_name(to);
    b.sendmsg(fd, &msg, flags)
        .map_err(|e| e.surface_as(Op::Sendto))
}
