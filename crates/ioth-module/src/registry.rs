//! `Ioth` — stack registry and per-descriptor dispatch.
//!
//! The registry creates stacks (static registrations first, then module
//! search), records which stack owns every descriptor it hands out, and
//! routes each socket primitive to the owner:
//!
//! ```text
//!   new_stack("vdestack,opts", ifaces)
//!        │  StackSpec::parse → factory | LoaderConfig::load → license gate
//!        ▼
//!   StackHandle ──msocket──▶ fd ──FdTable──▶ owner.enter().<primitive>()
//! ```
//!
//! All methods take `&self`; an `Ioth` is shared across threads as is.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock};

use libc::{c_int, c_long, c_ulong, c_void};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use ioth_core::error::{IothError, Result};
use ioth_core::license::check_license;
use ioth_core::msg::{RecvMsg, SendMsg};
use ioth_core::sockaddr::SockAddr;
use ioth_core::spec::{InterfaceSpec, StackSpec};
use ioth_core::StackBackend;

use crate::builtin::BackendFactory;
use crate::config::IothBuilder;
use crate::fd_table::FdTable;
use crate::host::HostStack;
use crate::loader::LoaderConfig;
use crate::stack::{Stack, StackHandle, StackState};

/// A refused `delete_stack`. The stack is still alive and usable; the
/// handle is handed back so the caller can retry.
pub struct DeleteError {
    pub stack: StackHandle,
    pub error: IothError,
}

impl fmt::Debug for DeleteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteError")
            .field("stack", &self.stack.id())
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for DeleteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot delete stack {}: {}", self.stack.id(), self.error)
    }
}

impl Error for DeleteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}

impl From<DeleteError> for IothError {
    fn from(e: DeleteError) -> Self {
        e.error
    }
}

pub struct Ioth {
    loader: LoaderConfig,
    factories: HashMap<String, BackendFactory>,
    license: OnceLock<String>,
    /// Well-known host stack. Never destroyed.
    host: StackHandle,
    default: RwLock<StackHandle>,
    fds: FdTable,
}

impl Default for Ioth {
    fn default() -> Self {
        Self::new()
    }
}

impl Ioth {
    /// Registry with loader settings from the environment and the
    /// built-in registrations.
    pub fn new() -> Self {
        Self::from_parts(LoaderConfig::from_env(), crate::builtin::defaults(), None)
    }

    pub fn builder() -> IothBuilder {
        IothBuilder::new()
    }

    pub(crate) fn from_parts(
        loader: LoaderConfig,
        factories: Vec<BackendFactory>,
        license: Option<String>,
    ) -> Self {
        let host = Stack::new(Box::new(HostStack::new()));
        let lic = OnceLock::new();
        if let Some(l) = license {
            let _ = lic.set(l);
        }
        Ioth {
            loader,
            factories: factories.into_iter().map(|f| (f.name.clone(), f)).collect(),
            license: lic,
            default: RwLock::new(host.clone()),
            host,
            fds: FdTable::new(),
        }
    }

    pub fn loader(&self) -> &LoaderConfig {
        &self.loader
    }

    // ── License ──

    /// Declare the program's SPDX license. Only the first call counts.
    pub fn set_license(&self, license: &str) -> Result<()> {
        self.license.set(license.to_owned()).map_err(|_| {
            IothError::InvalidInput(format!(
                "license already set to {:?}",
                self.license.get().map(String::as_str).unwrap_or_default()
            ))
        })
    }

    pub fn license(&self) -> Option<&str> {
        self.license.get().map(String::as_str)
    }

    fn gate(&self, backend: &str, backend_license: Option<&str>) -> Result<()> {
        if check_license(self.license(), backend_license) {
            return Ok(());
        }
        warn!(
            stack = backend,
            caller = self.license().unwrap_or("-"),
            backend_license = backend_license.unwrap_or("-"),
            "license denied"
        );
        Err(IothError::LicenseDenied {
            caller: self.license().map(str::to_owned),
            backend: backend.to_owned(),
        })
    }

    // ── Stack lifecycle ──

    /// Stack with no interfaces.
    pub fn new_stack(&self, spec: &str) -> Result<StackHandle> {
        self.new_stack_list(spec, &[])
    }

    /// Stack with at most one interface.
    pub fn new_stack_iface(&self, spec: &str, iface: Option<&str>) -> Result<StackHandle> {
        match iface {
            Some(i) => self.new_stack_list(spec, &[i]),
            None => self.new_stack_list(spec, &[]),
        }
    }

    /// Create a stack from `name[,options]` attached to `interfaces`.
    ///
    /// An empty name yields a fresh host stack.
    pub fn new_stack_list(&self, spec: &str, interfaces: &[&str]) -> Result<StackHandle> {
        let parsed = StackSpec::parse(spec)?;
        if parsed.is_host() {
            return Ok(self.new_stack_with(Box::new(HostStack::new())));
        }
        let backend: Box<dyn StackBackend> = match self.factories.get(parsed.name) {
            Some(factory) => {
                self.gate(parsed.name, factory.license.as_deref())?;
                let ifaces: Vec<_> = interfaces.iter().map(|i| InterfaceSpec::parse(i)).collect();
                factory.create(&ifaces, parsed.options)?
            }
            None => {
                let module = self.loader.load(parsed.name)?;
                self.gate(parsed.name, module.license())?;
                Box::new(module.instantiate(interfaces, parsed.options.unwrap_or(""))?)
            }
        };
        Ok(self.new_stack_with(backend))
    }

    /// Wrap an already constructed backend in a new stack.
    pub fn new_stack_with(&self, backend: Box<dyn StackBackend>) -> StackHandle {
        let native = backend.native_ops();
        let stack = Stack::new(backend);
        info!(
            stack = stack.id(),
            backend = stack.name(),
            native = native.len(),
            reachable = native.reachable().len(),
            "stack created"
        );
        stack
    }

    /// Destroy `stack`. Refused while it owns sockets, when the backend
    /// refuses, and for the well-known host stack.
    pub fn delete_stack(&self, stack: StackHandle) -> std::result::Result<(), DeleteError> {
        if Arc::ptr_eq(&stack, &self.host) {
            return Err(DeleteError {
                stack,
                error: IothError::InvalidInput("the default host stack cannot be deleted".into()),
            });
        }
        if let Err(error) = stack.begin_destroy() {
            debug!(stack = stack.id(), %error, "destroy refused");
            return Err(DeleteError { stack, error });
        }
        match stack.enter().release() {
            Ok(()) => {
                stack.finish_destroy(true);
                let mut default = self.default.write();
                if Arc::ptr_eq(&default, &stack) {
                    *default = self.host.clone();
                }
                info!(stack = stack.id(), backend = stack.name(), "stack destroyed");
                Ok(())
            }
            Err(error) => {
                stack.finish_destroy(false);
                warn!(stack = stack.id(), %error, "backend refused to release stack");
                Err(DeleteError { stack, error })
            }
        }
    }

    /// Stack used by [`socket`](Self::socket) and `msocket(None, ..)`.
    pub fn default_stack(&self) -> StackHandle {
        self.default.read().clone()
    }

    /// Replace the default stack; `None` restores the host stack.
    pub fn set_default_stack(&self, stack: Option<StackHandle>) -> Result<()> {
        let stack = stack.unwrap_or_else(|| self.host.clone());
        // Checked under the lock: a racing delete either already marked the
        // stack destroyed, or will see it installed and reset the default.
        let mut default = self.default.write();
        if stack.state() == StackState::Destroyed {
            return Err(IothError::InvalidInput(format!(
                "stack {} is destroyed",
                stack.id()
            )));
        }
        *default = stack;
        Ok(())
    }

    // ── Descriptor lifecycle ──

    /// Open a socket on `stack` (default stack if `None`).
    pub fn msocket(
        &self,
        stack: Option<&StackHandle>,
        domain: c_int,
        ty: c_int,
        protocol: c_int,
    ) -> Result<RawFd> {
        let stack = match stack {
            Some(s) => s.clone(),
            None => self.default_stack(),
        };
        let backend = stack.enter();
        stack.begin_open()?;
        match backend.socket(domain, ty, protocol) {
            Ok(fd) => {
                trace!(fd, stack = stack.id(), "socket opened");
                self.fds.insert(fd, stack);
                Ok(fd)
            }
            Err(e) => {
                stack.abort_open();
                Err(e)
            }
        }
    }

    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<RawFd> {
        self.msocket(None, domain, ty, protocol)
    }

    /// Close `fd`. Ownership is dropped only if the backend succeeds.
    pub fn close(&self, fd: RawFd) -> Result<()> {
        self.fds.close_with(fd, |stack| {
            stack.enter().close(fd).map_err(|error| {
                warn!(fd, stack = stack.id(), %error, "close failed; descriptor kept");
                error
            })
        })
    }

    /// Accept on `fd`. The new descriptor belongs to the listener's stack.
    pub fn accept(&self, fd: RawFd, addr: Option<&mut SockAddr>) -> Result<RawFd> {
        let stack = self.fds.owner(fd)?;
        let newfd = stack.enter().accept(fd, addr)?;
        stack.adopt();
        trace!(fd = newfd, listener = fd, stack = stack.id(), "connection accepted");
        self.fds.insert(newfd, stack);
        Ok(newfd)
    }

    /// Owning stack of `fd`, if the registry knows it.
    pub fn owner(&self, fd: RawFd) -> Option<StackHandle> {
        self.fds.lookup(fd)
    }

    /// Number of descriptors currently tracked.
    pub fn open_descriptors(&self) -> usize {
        self.fds.len()
    }

    #[inline]
    fn with_owner<T>(
        &self,
        fd: RawFd,
        f: impl FnOnce(&dyn StackBackend) -> Result<T>,
    ) -> Result<T> {
        let stack = self.fds.owner(fd)?;
        f(stack.enter())
    }

    // ── Control path ──

    pub fn bind(&self, fd: RawFd, addr: &SockAddr) -> Result<()> {
        self.with_owner(fd, |b| b.bind(fd, addr))
    }

    pub fn connect(&self, fd: RawFd, addr: &SockAddr) -> Result<()> {
        self.with_owner(fd, |b| b.connect(fd, addr))
    }

    pub fn listen(&self, fd: RawFd, backlog: c_int) -> Result<()> {
        self.with_owner(fd, |b| b.listen(fd, backlog))
    }

    pub fn getsockname(&self, fd: RawFd, addr: &mut SockAddr) -> Result<()> {
        self.with_owner(fd, |b| b.getsockname(fd, addr))
    }

    pub fn getpeername(&self, fd: RawFd, addr: &mut SockAddr) -> Result<()> {
        self.with_owner(fd, |b| b.getpeername(fd, addr))
    }

    pub fn setsockopt(&self, fd: RawFd, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
        self.with_owner(fd, |b| b.setsockopt(fd, level, name, value))
    }

    pub fn getsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        value: &mut [u8],
    ) -> Result<usize> {
        self.with_owner(fd, |b| b.getsockopt(fd, level, name, value))
    }

    pub fn shutdown(&self, fd: RawFd, how: c_int) -> Result<()> {
        self.with_owner(fd, |b| b.shutdown(fd, how))
    }

    /// # Safety
    /// `arg` must be valid for whatever `request` reads or writes.
    pub unsafe fn ioctl(&self, fd: RawFd, request: c_ulong, arg: *mut c_void) -> Result<c_int> {
        self.with_owner(fd, |b| b.ioctl(fd, request, arg))
    }

    pub fn fcntl(&self, fd: RawFd, cmd: c_int, arg: c_long) -> Result<c_int> {
        self.with_owner(fd, |b| b.fcntl(fd, cmd, arg))
    }

    // ── Data path ──

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        self.with_owner(fd, |b| b.read(fd, buf))
    }

    pub fn readv(&self, fd: RawFd, iov: &mut [IoSliceMut<'_>]) -> Result<usize> {
        self.with_owner(fd, |b| b.readv(fd, iov))
    }

    pub fn recv(&self, fd: RawFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
        self.with_owner(fd, |b| b.recv(fd, buf, flags))
    }

    pub fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: c_int,
        from: Option<&mut SockAddr>,
    ) -> Result<usize> {
        self.with_owner(fd, |b| b.recvfrom(fd, buf, flags, from))
    }

    pub fn recvmsg(&self, fd: RawFd, msg: &mut RecvMsg<'_, '_>, flags: c_int) -> Result<usize> {
        self.with_owner(fd, |b| b.recvmsg(fd, msg, flags))
    }

    pub fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        self.with_owner(fd, |b| b.write(fd, buf))
    }

    pub fn writev(&self, fd: RawFd, iov: &[IoSlice<'_>]) -> Result<usize> {
        self.with_owner(fd, |b| b.writev(fd, iov))
    }

    pub fn send(&self, fd: RawFd, buf: &[u8], flags: c_int) -> Result<usize> {
        self.with_owner(fd, |b| b.send(fd, buf, flags))
    }

    pub fn sendto(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: c_int,
        to: Option<&SockAddr>,
    ) -> Result<usize> {
        self.with_owner(fd, |b| b.sendto(fd, buf, flags, to))
    }

    pub fn sendmsg(&self, fd: RawFd, msg: &SendMsg<'_, '_>, flags: c_int) -> Result<usize> {
        self.with_owner(fd, |b| b.sendmsg(fd, msg, flags))
    }
}

impl Drop for Ioth {
    fn drop(&mut self) {
        let open = self.fds.len();
        if open != 0 {
            debug!(open, "registry dropped with descriptors still open");
        }
    }
}
