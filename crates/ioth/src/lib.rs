//! # ioth — choose your networking stack at run time
//!
//! A program opens sockets on *stacks*. The host kernel is one stack;
//! user-space TCP/IP stacks are others, loaded as plugins by name. After a
//! socket is opened, every primitive on its descriptor is routed to the
//! stack that created it, so the rest of the program is stack-agnostic.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ioth::SockAddr;
//!
//! // Kernel stack, or "vdestack" attached to a VDE network
//! let stack = ioth::new_stack!("vdestack", "vde:///tmp/switch")?;
//!
//! let fd = ioth::msocket(Some(&stack), libc::AF_INET, libc::SOCK_DGRAM, 0)?;
//! let peer: SockAddr = "10.0.0.1:5000".parse::<std::net::SocketAddr>()?.into();
//! ioth::sendto(fd, b"hello", 0, Some(&peer))?;
//! ioth::close(fd)?;
//!
//! ioth::delete_stack(stack)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │         new_stack!(), msocket(), read(), sendto() …         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Ioth registry                             │
//! │     FD ownership table, lifecycle, context slot             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ HostStack │      │  Factory  │      │ DynStack  │
//!    │  (libc)   │      │ (Rust)    │      │ (plugin)  │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```
//!
//! The free functions here act on one lazily created process-wide
//! registry. Programs that want several registries, or custom
//! configuration, use [`Ioth`] directly or call [`init`] first.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::sync::OnceLock;

use libc::{c_int, c_long, c_ulong, c_void};

pub use ioth_core::{
    IothError, InterfaceSpec, Op, OpSet, RecvMsg, Result, SendMsg, SockAddr, StackBackend,
    StackSpec,
};
pub use ioth_core::license::check_license;
pub use ioth_module::{
    BackendFactory, DeleteError, HostStack, Ioth, IothBuilder, LoaderConfig, Stack, StackHandle,
    StackState,
};

static GLOBAL: OnceLock<Ioth> = OnceLock::new();

/// The process-wide registry, created from the environment on first use.
pub fn global() -> &'static Ioth {
    GLOBAL.get_or_init(Ioth::new)
}

/// Install a custom process-wide registry. Fails if one already exists.
pub fn init(builder: IothBuilder) -> Result<&'static Ioth> {
    let ioth = builder.build()?;
    GLOBAL
        .set(ioth)
        .map_err(|_| IothError::InvalidInput("ioth registry already initialised".into()))?;
    Ok(global())
}

/// Create a stack from `name[,options]` and any number of interfaces.
///
/// ```ignore
/// let host = ioth::new_stack!("")?;
/// let vde = ioth::new_stack!("vdestack", "vde://", "eth1=vxvde://234.0.0.1")?;
/// ```
#[macro_export]
macro_rules! new_stack {
    ($spec:expr $(,)?) => {
        $crate::new_stack_list($spec, &[])
    };
    ($spec:expr, $($iface:expr),+ $(,)?) => {
        $crate::new_stack_list($spec, &[$($iface),+])
    };
}

// ── Stacks ──

pub fn set_license(license: &str) -> Result<()> {
    global().set_license(license)
}

pub fn new_stack(spec: &str) -> Result<StackHandle> {
    global().new_stack(spec)
}

pub fn new_stack_iface(spec: &str, iface: Option<&str>) -> Result<StackHandle> {
    global().new_stack_iface(spec, iface)
}

pub fn new_stack_list(spec: &str, interfaces: &[&str]) -> Result<StackHandle> {
    global().new_stack_list(spec, interfaces)
}

pub fn delete_stack(stack: StackHandle) -> std::result::Result<(), DeleteError> {
    global().delete_stack(stack)
}

pub fn set_default_stack(stack: Option<StackHandle>) -> Result<()> {
    global().set_default_stack(stack)
}

pub fn default_stack() -> StackHandle {
    global().default_stack()
}

// ── Descriptors ──

pub fn msocket(
    stack: Option<&StackHandle>,
    domain: c_int,
    ty: c_int,
    protocol: c_int,
) -> Result<RawFd> {
    global().msocket(stack, domain, ty, protocol)
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> Result<RawFd> {
    global().socket(domain, ty, protocol)
}

pub fn close(fd: RawFd) -> Result<()> {
    global().close(fd)
}

pub fn bind(fd: RawFd, addr: &SockAddr) -> Result<()> {
    global().bind(fd, addr)
}

pub fn connect(fd: RawFd, addr: &SockAddr) -> Result<()> {
    global().connect(fd, addr)
}

pub fn listen(fd: RawFd, backlog: c_int) -> Result<()> {
    global().listen(fd, backlog)
}

pub fn accept(fd: RawFd, addr: Option<&mut SockAddr>) -> Result<RawFd> {
    global().accept(fd, addr)
}

pub fn getsockname(fd: RawFd, addr: &mut SockAddr) -> Result<()> {
    global().getsockname(fd, addr)
}

pub fn getpeername(fd: RawFd, addr: &mut SockAddr) -> Result<()> {
    global().getpeername(fd, addr)
}

pub fn setsockopt(fd: RawFd, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
    global().setsockopt(fd, level, name, value)
}

pub fn getsockopt(fd: RawFd, level: c_int, name: c_int, value: &mut [u8]) -> Result<usize> {
    global().getsockopt(fd, level, name, value)
}

pub fn shutdown(fd: RawFd, how: c_int) -> Result<()> {
    global().shutdown(fd, how)
}

/// # Safety
/// `arg` must be valid for whatever `request` reads or writes.
pub unsafe fn ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> Result<c_int> {
    global().ioctl(fd, request, arg)
}

pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_long) -> Result<c_int> {
    global().fcntl(fd, cmd, arg)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    global().read(fd, buf)
}

pub fn readv(fd: RawFd, iov: &mut [IoSliceMut<'_>]) -> Result<usize> {
    global().readv(fd, iov)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
    global().recv(fd, buf, flags)
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
    from: Option<&mut SockAddr>,
) -> Result<usize> {
    global().recvfrom(fd, buf, flags, from)
}

pub fn recvmsg(fd: RawFd, msg: &mut RecvMsg<'_, '_>, flags: c_int) -> Result<usize> {
    global().recvmsg(fd, msg, flags)
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    global().write(fd, buf)
}

pub fn writev(fd: RawFd, iov: &[IoSlice<'_>]) -> Result<usize> {
    global().writev(fd, iov)
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> Result<usize> {
    global().send(fd, buf, flags)
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, to: Option<&SockAddr>) -> Result<usize> {
    global().sendto(fd, buf, flags, to)
}

pub fn sendmsg(fd: RawFd, msg: &SendMsg<'_, '_>, flags: c_int) -> Result<usize> {
    global().sendmsg(fd, msg, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_forms_converge() {
        let a = new_stack!("").unwrap();
        let b = new_stack!("", "vde://").unwrap();
        let c = new_stack!("kernel", "eth0=vde://", "tap://tap0",).unwrap();
        assert_eq!(a.name(), "kernel");
        assert_eq!(b.name(), "kernel");
        assert_eq!(c.name(), "kernel");
        delete_stack(a).unwrap();
        delete_stack(b).unwrap();
        delete_stack(c).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unix_stream_over_default_stack() {
        let lfd = socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        // Abstract socket name, unique per process.
        let mut addr = SockAddr::empty();
        let name = format!("\0ioth-test-{}", std::process::id());
        unsafe {
            let sun = &mut *(addr.as_mut_ptr() as *mut libc::sockaddr_un);
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            for (dst, src) in sun.sun_path.iter_mut().zip(name.bytes()) {
                *dst = src as libc::c_char;
            }
        }
        let len = std::mem::size_of::<libc::sa_family_t>() + name.len();
        addr.set_len(len as libc::socklen_t);
        bind(lfd, &addr).unwrap();
        listen(lfd, 1).unwrap();

        let cfd = socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        connect(cfd, &addr).unwrap();
        let sfd = accept(lfd, None).unwrap();
        assert!(std::sync::Arc::ptr_eq(
            &global().owner(sfd).unwrap(),
            &global().owner(lfd).unwrap()
        ));

        assert_eq!(write(cfd, b"over unix").unwrap(), 9);
        let mut buf = [0u8; 16];
        let n = read(sfd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"over unix");

        close(lfd).unwrap();
        assert!(std::sync::Arc::ptr_eq(
            &global().owner(sfd).unwrap(),
            &default_stack()
        ));
        shutdown(cfd, libc::SHUT_RDWR).unwrap();
        for fd in [sfd, cfd] {
            close(fd).unwrap();
        }
    }

    #[test]
    fn unowned_descriptor_is_bad() {
        let mut buf = [0u8; 1];
        let err = recv(-1, &mut buf, 0).unwrap_err();
        assert_eq!(err.errno() as i32, libc::EBADF);
    }
}
