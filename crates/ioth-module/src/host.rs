//! `HostStack` — the kernel's own networking stack.
//!
//! Every primitive is a direct libc call, so every slot is native and no
//! derivation ever runs. This is the backend behind the empty stack name,
//! the well-known default stack, and the `host`/`kernel` registrations.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, c_long, c_ulong, c_void};

use ioth_core::abi::OpSet;
use ioth_core::backend::StackBackend;
use ioth_core::error::{cvt, cvt_size, Result};
use ioth_core::msg::{RecvMsg, SendMsg};
use ioth_core::sockaddr::SockAddr;

/// Kernel stack. Stateless; one instance per `Stack`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostStack;

impl HostStack {
    pub const NAME: &'static str = "kernel";

    pub fn new() -> Self {
        HostStack
    }
}

#[inline]
fn opt_addr(addr: Option<&mut SockAddr>) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
    match addr {
        Some(a) => (a.as_mut_ptr(), a.len_mut() as *mut _),
        None => (ptr::null_mut(), ptr::null_mut()),
    }
}

impl StackBackend for HostStack {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn native_ops(&self) -> OpSet {
        OpSet::FULL
    }

    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<RawFd> {
        cvt(unsafe { libc::socket(domain, ty, protocol) })
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        cvt(unsafe { libc::close(fd) }).map(drop)
    }

    fn bind(&self, fd: RawFd, addr: &SockAddr) -> Result<()> {
        cvt(unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) }).map(drop)
    }

    fn connect(&self, fd: RawFd, addr: &SockAddr) -> Result<()> {
        cvt(unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) }).map(drop)
    }

    fn listen(&self, fd: RawFd, backlog: c_int) -> Result<()> {
        cvt(unsafe { libc::listen(fd, backlog) }).map(drop)
    }

    fn accept(&self, fd: RawFd, addr: Option<&mut SockAddr>) -> Result<RawFd> {
        let (sa, len) = opt_addr(addr);
        cvt(unsafe { libc::accept(fd, sa, len) })
    }

    fn getsockname(&self, fd: RawFd, addr: &mut SockAddr) -> Result<()> {
        let (sa, len) = (addr.as_mut_ptr(), addr.len_mut() as *mut _);
        cvt(unsafe { libc::getsockname(fd, sa, len) }).map(drop)
    }

    fn getpeername(&self, fd: RawFd, addr: &mut SockAddr) -> Result<()> {
        let (sa, len) = (addr.as_mut_ptr(), addr.len_mut() as *mut _);
        cvt(unsafe { libc::getpeername(fd, sa, len) }).map(drop)
    }

    fn setsockopt(&self, fd: RawFd, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
        cvt(unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value.as_ptr() as *const c_void,
                value.len() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    fn getsockopt(&self, fd: RawFd, level: c_int, name: c_int, value: &mut [u8]) -> Result<usize> {
        let mut len = value.len() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(fd, level, name, value.as_mut_ptr() as *mut c_void, &mut len)
        })?;
        Ok(len as usize)
    }

    fn shutdown(&self, fd: RawFd, how: c_int) -> Result<()> {
        cvt(unsafe { libc::shutdown(fd, how) }).map(drop)
    }

    unsafe fn ioctl(&self, fd: RawFd, request: c_ulong, arg: *mut c_void) -> Result<c_int> {
        // The request parameter type differs between libcs.
        cvt(libc::ioctl(fd, request as _, arg))
    }

    fn fcntl(&self, fd: RawFd, cmd: c_int, arg: c_long) -> Result<c_int> {
        cvt(unsafe { libc::fcntl(fd, cmd, arg) })
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) })
    }

    fn readv(&self, fd: RawFd, iov: &mut [IoSliceMut<'_>]) -> Result<usize> {
        cvt_size(unsafe {
            libc::readv(fd, iov.as_mut_ptr() as *const libc::iovec, iov.len() as c_int)
        })
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
        cvt_size(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) })
    }

    fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: c_int,
        from: Option<&mut SockAddr>,
    ) -> Result<usize> {
        let (sa, len) = opt_addr(from);
        cvt_size(unsafe {
            libc::recvfrom(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags, sa, len)
        })
    }

    fn recvmsg(&self, fd: RawFd, msg: &mut RecvMsg<'_, '_>, flags: c_int) -> Result<usize> {
        msg.with_raw(|hdr| unsafe { libc::recvmsg(fd, hdr, flags) })
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        cvt_size(unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) })
    }

    fn writev(&self, fd: RawFd, iov: &[IoSlice<'_>]) -> Result<usize> {
        cvt_size(unsafe {
            libc::writev(fd, iov.as_ptr() as *const libc::iovec, iov.len() as c_int)
        })
    }

    fn send(&self, fd: RawFd, buf: &[u8], flags: c_int) -> Result<usize> {
        cvt_size(unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) })
    }

    fn sendto(&self, fd: RawFd, buf: &[u8], flags: c_int, to: Option<&SockAddr>) -> Result<usize> {
        let (sa, len) = match to {
            Some(a) => (a.as_ptr(), a.len()),
            None => (ptr::null(), 0),
        };
        cvt_size(unsafe {
            libc::sendto(fd, buf.as_ptr() as *const c_void, buf.len(), flags, sa, len)
        })
    }

    fn sendmsg(&self, fd: RawFd, msg: &SendMsg<'_, '_>, flags: c_int) -> Result<usize> {
        msg.with_raw(|hdr| unsafe { libc::sendmsg(fd, hdr, flags) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ioth_core::error::IothError;
    use std::net::SocketAddr;

    fn udp_pair(h: &HostStack) -> (RawFd, RawFd, SockAddr) {
        let any = SockAddr::from("127.0.0.1:0".parse::<SocketAddr>().unwrap());
        let a = h.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        let b = h.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        h.bind(a, &any).unwrap();
        h.bind(b, &any).unwrap();
        let mut b_addr = SockAddr::empty();
        h.getsockname(b, &mut b_addr).unwrap();
        (a, b, b_addr)
    }

    #[test]
    fn udp_loopback_sendto_recvfrom() {
        let h = HostStack::new();
        let (a, b, b_addr) = udp_pair(&h);

        assert_eq!(h.sendto(a, b"hello", 0, Some(&b_addr)).unwrap(), 5);

        let mut from = SockAddr::empty();
        let mut buf = [0u8; 32];
        let n = h.recvfrom(b, &mut buf, 0, Some(&mut from)).unwrap();
        assert_eq!(&buf[..n], b"hello");

        let mut a_addr = SockAddr::empty();
        h.getsockname(a, &mut a_addr).unwrap();
        assert_eq!(from.as_socket_addr(), a_addr.as_socket_addr());

        h.close(a).unwrap();
        h.close(b).unwrap();
    }

    #[test]
    fn unix_pair_vectored_io() {
        let h = HostStack::new();
        let mut sv = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) },
            0
        );
        let out = [IoSlice::new(b"ab"), IoSlice::new(b"cde")];
        assert_eq!(h.writev(sv[0], &out).unwrap(), 5);

        let mut x = [0u8; 2];
        let mut y = [0u8; 8];
        let mut iov = [IoSliceMut::new(&mut x), IoSliceMut::new(&mut y)];
        assert_eq!(h.readv(sv[1], &mut iov).unwrap(), 5);
        assert_eq!(&x, b"ab");
        assert_eq!(&y[..3], b"cde");

        h.close(sv[0]).unwrap();
        h.close(sv[1]).unwrap();
    }

    #[test]
    fn sockopt_round_trip() {
        let h = HostStack::new();
        let fd = h.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let on: c_int = 1;
        h.setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &on.to_ne_bytes())
            .unwrap();
        let mut val = [0u8; 4];
        let len = h
            .getsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &mut val)
            .unwrap();
        assert_eq!(len, 4);
        assert_ne!(c_int::from_ne_bytes(val), 0);

        let fl = h.fcntl(fd, libc::F_GETFL, 0).unwrap();
        h.fcntl(fd, libc::F_SETFL, (fl | libc::O_NONBLOCK) as c_long).unwrap();
        assert_ne!(h.fcntl(fd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK, 0);
        h.close(fd).unwrap();
    }

    #[test]
    fn errors_carry_errno() {
        let h = HostStack::new();
        let mut buf = [0u8; 4];
        let err = h.recv(-1, &mut buf, 0).unwrap_err();
        assert!(matches!(err, IothError::Os(nix::errno::Errno::EBADF)));
    }
}
