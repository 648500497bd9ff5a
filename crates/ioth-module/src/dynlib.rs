//! Dynamically loaded stack modules.
//!
//! A module `X` is a shared object exporting `ioth_X_newstack` and any
//! subset of `ioth_X_<primitive>`. Symbols fill an [`AbiTable`], whose
//! layout is the C `struct ioth_functions`. `newstack` receives the table
//! and may bind further slots itself before returning its stack data.
//!
//! ```text
//!   Library ──resolve──▶ Module ──license gate──▶ instantiate ──▶ DynStack
//!   (dlmopen)            (dlsym x25)              (newstack)      (StackBackend)
//! ```
//!
//! `DynStack` adapts the table to [`StackBackend`]: bound slots are
//! called directly, unbound narrow I/O slots go through the derivations,
//! unbound control slots are `Unsupported`.

use std::ffi::{CStr, CString};
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{
    c_char, c_int, c_long, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
};
use nix::errno::Errno;
use tracing::{debug, warn};

use ioth_core::abi::{Op, OpSet};
use ioth_core::backend::StackBackend;
use ioth_core::derive;
use ioth_core::error::{cvt, cvt_size, IothError, Result};
use ioth_core::msg::{RecvMsg, SendMsg};
use ioth_core::sockaddr::SockAddr;

use crate::context;

// ── C slot types ──

pub type GetStackDataFn = extern "C" fn() -> *mut c_void;
pub type NewStackFn =
    unsafe extern "C" fn(*const *const c_char, *const c_char, *mut AbiTable) -> *mut c_void;
pub type DelStackFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type AddrInFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub type AddrOutFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
pub type ListenFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
pub type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;
pub type GetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
pub type ShutdownFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
pub type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
pub type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type VecFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
pub type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
pub type RecvfromFn = unsafe extern "C" fn(
    c_int,
    *mut c_void,
    size_t,
    c_int,
    *mut sockaddr,
    *mut socklen_t,
) -> ssize_t;
pub type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub type SendtoFn = unsafe extern "C" fn(
    c_int,
    *const c_void,
    size_t,
    c_int,
    *const sockaddr,
    socklen_t,
) -> ssize_t;
pub type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;

/// `struct ioth_functions`. Field order is ABI.
#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct AbiTable {
    pub getstackdata: Option<GetStackDataFn>,
    pub newstack: Option<NewStackFn>,
    pub delstack: Option<DelStackFn>,
    pub socket: Option<SocketFn>,
    pub close: Option<CloseFn>,
    pub bind: Option<AddrInFn>,
    pub connect: Option<AddrInFn>,
    pub listen: Option<ListenFn>,
    pub accept: Option<AddrOutFn>,
    pub getsockname: Option<AddrOutFn>,
    pub getpeername: Option<AddrOutFn>,
    pub setsockopt: Option<SetsockoptFn>,
    pub getsockopt: Option<GetsockoptFn>,
    pub shutdown: Option<ShutdownFn>,
    pub ioctl: Option<IoctlFn>,
    pub fcntl: Option<FcntlFn>,
    pub read: Option<ReadFn>,
    pub readv: Option<VecFn>,
    pub recv: Option<RecvFn>,
    pub recvfrom: Option<RecvfromFn>,
    pub recvmsg: Option<RecvmsgFn>,
    pub write: Option<WriteFn>,
    pub writev: Option<VecFn>,
    pub send: Option<SendFn>,
    pub sendto: Option<SendtoFn>,
    pub sendmsg: Option<SendmsgFn>,
}

impl AbiTable {
    /// Primitives whose slot is bound.
    pub fn bound_ops(&self) -> OpSet {
        let slots = [
            self.socket.is_some(),
            self.close.is_some(),
            self.bind.is_some(),
            self.connect.is_some(),
            self.listen.is_some(),
            self.accept.is_some(),
            self.getsockname.is_some(),
            self.getpeername.is_some(),
            self.setsockopt.is_some(),
            self.getsockopt.is_some(),
            self.shutdown.is_some(),
            self.ioctl.is_some(),
            self.fcntl.is_some(),
            self.read.is_some(),
            self.readv.is_some(),
            self.recv.is_some(),
            self.recvfrom.is_some(),
            self.recvmsg.is_some(),
            self.write.is_some(),
            self.writev.is_some(),
            self.send.is_some(),
            self.sendto.is_some(),
            self.sendmsg.is_some(),
        ];
        Op::ALL
            .into_iter()
            .zip(slots)
            .filter_map(|(op, bound)| bound.then_some(op))
            .collect()
    }
}

// ── Shared object handle ──

/// Link-map namespace a module is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Fresh link map: the module gets private copies of its
    /// dependencies, so several instances do not share global state.
    Isolated,
    /// The program's own link map.
    Shared,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_env = "gnu"))] {
        type Lmid = c_long;
        const LM_ID_BASE: Lmid = 0;
        const LM_ID_NEWLM: Lmid = -1;

        extern "C" {
            fn dlmopen(lmid: Lmid, filename: *const c_char, flags: c_int) -> *mut c_void;
        }

        unsafe fn raw_open(path: &CStr, ns: Namespace, flags: c_int) -> *mut c_void {
            let lmid = match ns {
                Namespace::Isolated => LM_ID_NEWLM,
                Namespace::Shared => LM_ID_BASE,
            };
            dlmopen(lmid, path.as_ptr(), flags)
        }
    } else {
        // No link-map namespaces: both variants share the base namespace.
        unsafe fn raw_open(path: &CStr, _ns: Namespace, flags: c_int) -> *mut c_void {
            libc::dlopen(path.as_ptr(), flags)
        }
    }
}

fn dlerror_string() -> String {
    // SAFETY: dlerror returns a thread-local, NUL-terminated message or null.
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "unknown dynamic loader error".to_owned()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

/// Loaded shared object. Unloaded on drop.
pub struct Library {
    handle: NonNull<c_void>,
    path: PathBuf,
}

// SAFETY: dl* handles may be used and closed from any thread.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Load `path` with `RTLD_NOW`. The error is the loader's message.
    pub fn open(path: &Path, ns: Namespace) -> std::result::Result<Self, String> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| "path contains NUL".to_owned())?;
        // SAFETY: cpath is a valid C string.
        let handle = unsafe { raw_open(&cpath, ns, libc::RTLD_NOW) };
        NonNull::new(handle)
            .map(|handle| Library {
                handle,
                path: path.to_owned(),
            })
            .ok_or_else(dlerror_string)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up `name` and reinterpret its address as `T`.
    ///
    /// # Safety
    /// `T` must be a pointer-sized type matching what the symbol really is.
    pub unsafe fn symbol<T: Copy>(&self, name: &str) -> Option<T> {
        debug_assert_eq!(mem::size_of::<T>(), mem::size_of::<*mut c_void>());
        let cname = CString::new(name).ok()?;
        let sym = libc::dlsym(self.handle.as_ptr(), cname.as_ptr());
        if sym.is_null() {
            None
        } else {
            Some(mem::transmute_copy::<*mut c_void, T>(&sym))
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful dlopen and is closed once.
        if unsafe { libc::dlclose(self.handle.as_ptr()) } != 0 {
            warn!(path = %self.path.display(), error = %dlerror_string(), "dlclose failed");
        }
    }
}

fn backend_errno() -> Errno {
    match Errno::last() {
        Errno::UnknownErrno => Errno::EIO,
        e => e,
    }
}

// ── Resolved module ──

/// A module whose symbols are resolved but whose stack is not created yet.
pub struct Module {
    name: String,
    table: AbiTable,
    license: Option<String>,
    lib: Option<Library>,
}

impl Module {
    /// Resolve `<prefix><name>_<slot>` for every slot.
    ///
    /// Fails with `MissingEntryPoint` when `newstack` is absent; the
    /// library is unloaded on that path.
    pub fn resolve(lib: Library, prefix: &str, name: &str) -> Result<Self> {
        let base = format!("{prefix}{name}_");
        macro_rules! slots {
            ($($slot:ident),* $(,)?) => {
                AbiTable {
                    getstackdata: Some(context::getstackdata),
                    // SAFETY: each slot type is the C prototype of that symbol.
                    $($slot: unsafe { lib.symbol(&format!("{base}{}", stringify!($slot))) },)*
                }
            };
        }
        let table = slots!(
            newstack, delstack, socket, close, bind, connect, listen, accept,
            getsockname, getpeername, setsockopt, getsockopt, shutdown, ioctl,
            fcntl, read, readv, recv, recvfrom, recvmsg, write, writev, send,
            sendto, sendmsg,
        );
        if table.newstack.is_none() {
            return Err(IothError::MissingEntryPoint {
                symbol: format!("{base}newstack"),
            });
        }

        // `const char *ioth_X_license`: the symbol is the pointer variable.
        let license = unsafe {
            lib.symbol::<*const *const c_char>(&format!("{base}license"))
                .filter(|var| !(**var).is_null())
                .map(|var| CStr::from_ptr(*var).to_string_lossy().into_owned())
        };

        debug!(
            module = name,
            path = %lib.path().display(),
            bound = table.bound_ops().len(),
            license = license.as_deref().unwrap_or("-"),
            "module symbols resolved"
        );
        Ok(Module {
            name: name.to_owned(),
            table,
            license,
            lib: Some(lib),
        })
    }

    /// Module built from an in-process table, with nothing to unload.
    pub fn from_table(name: &str, mut table: AbiTable, license: Option<&str>) -> Self {
        table.getstackdata = Some(context::getstackdata);
        Module {
            name: name.to_owned(),
            table,
            license: license.map(str::to_owned),
            lib: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// SPDX identifier the module declares, if any.
    pub fn license(&self) -> Option<&str> {
        self.license.as_deref()
    }

    /// Call `newstack(interfaces, options, &table)`.
    ///
    /// A null return is `Backend(errno)`; the module is dropped (and
    /// unloaded) with it.
    pub fn instantiate(mut self, interfaces: &[&str], options: &str) -> Result<DynStack> {
        let newstack = self.table.newstack.ok_or_else(|| IothError::MissingEntryPoint {
            symbol: format!("{}_newstack", self.name),
        })?;
        let ifaces = interfaces
            .iter()
            .map(|s| CString::new(*s))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| IothError::InvalidInput("interface contains NUL".into()))?;
        let options = CString::new(options)
            .map_err(|_| IothError::InvalidInput("options contain NUL".into()))?;
        let mut argv: Vec<*const c_char> = ifaces.iter().map(|s| s.as_ptr()).collect();
        argv.push(ptr::null());

        Errno::clear();
        // SAFETY: argv is NULL-terminated and outlives the call; the table
        // is a valid ioth_functions the module may write slots into.
        let data = unsafe { newstack(argv.as_ptr(), options.as_ptr(), &mut self.table) };
        if data.is_null() {
            let errno = backend_errno();
            warn!(module = %self.name, %errno, "newstack failed");
            return Err(IothError::Backend(errno));
        }
        Ok(DynStack::new(self, data))
    }
}

// ── Stack backend over a C table ──

/// Stack instance created by a module.
pub struct DynStack {
    name: String,
    table: AbiTable,
    native: OpSet,
    data: *mut c_void,
    released: AtomicBool,
    // Dropped last: every slot points into it.
    _lib: Option<Library>,
}

// SAFETY: the table holds plain C function pointers and `data` is only
// handed back to the module; thread safety of the stack itself is the
// module's contract, as for any C socket API.
unsafe impl Send for DynStack {}
unsafe impl Sync for DynStack {}

impl DynStack {
    fn new(module: Module, data: *mut c_void) -> Self {
        let native = module.table.bound_ops();
        DynStack {
            name: module.name,
            table: module.table,
            native,
            data,
            released: AtomicBool::new(false),
            _lib: module.lib,
        }
    }

    fn delstack(&self) -> Result<()> {
        match self.table.delstack {
            None => Ok(()),
            Some(f) => {
                Errno::clear();
                // SAFETY: data came from this module's newstack.
                if unsafe { f(self.data) } == 0 {
                    Ok(())
                } else {
                    Err(IothError::Backend(backend_errno()))
                }
            }
        }
    }
}

impl Drop for DynStack {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            if let Err(e) = self.delstack() {
                warn!(stack = %self.name, error = %e, "delstack failed during drop");
            }
        }
    }
}

#[inline]
fn opt_addr(addr: Option<&mut SockAddr>) -> (*mut sockaddr, *mut socklen_t) {
    match addr {
        Some(a) => (a.as_mut_ptr(), a.len_mut() as *mut _),
        None => (ptr::null_mut(), ptr::null_mut()),
    }
}

impl StackBackend for DynStack {
    fn name(&self) -> &str {
        &self.name
    }

    fn native_ops(&self) -> OpSet {
        self.native
    }

    fn stack_data(&self) -> *mut c_void {
        self.data
    }

    fn release(&self) -> Result<()> {
        self.delstack()?;
        self.released.store(true, Ordering::Release);
        Ok(())
    }

    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<RawFd> {
        let f = self.table.socket.ok_or(IothError::Unsupported(Op::Socket))?;
        cvt(unsafe { f(domain, ty, protocol) })
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        let f = self.table.close.ok_or(IothError::Unsupported(Op::Close))?;
        cvt(unsafe { f(fd) }).map(drop)
    }

    fn bind(&self, fd: RawFd, addr: &SockAddr) -> Result<()> {
        let f = self.table.bind.ok_or(IothError::Unsupported(Op::Bind))?;
        cvt(unsafe { f(fd, addr.as_ptr(), addr.len()) }).map(drop)
    }

    fn connect(&self, fd: RawFd, addr: &SockAddr) -> Result<()> {
        let f = self.table.connect.ok_or(IothError::Unsupported(Op::Connect))?;
        cvt(unsafe { f(fd, addr.as_ptr(), addr.len()) }).map(drop)
    }

    fn listen(&self, fd: RawFd, backlog: c_int) -> Result<()> {
        let f = self.table.listen.ok_or(IothError::Unsupported(Op::Listen))?;
        cvt(unsafe { f(fd, backlog) }).map(drop)
    }

    fn accept(&self, fd: RawFd, addr: Option<&mut SockAddr>) -> Result<RawFd> {
        let f = self.table.accept.ok_or(IothError::Unsupported(Op::Accept))?;
        let (sa, len) = opt_addr(addr);
        cvt(unsafe { f(fd, sa, len) })
    }

    fn getsockname(&self, fd: RawFd, addr: &mut SockAddr) -> Result<()> {
        let f = self.table.getsockname.ok_or(IothError::Unsupported(Op::Getsockname))?;
        let (sa, len) = opt_addr(Some(addr));
        cvt(unsafe { f(fd, sa, len) }).map(drop)
    }

    fn getpeername(&self, fd: RawFd, addr: &mut SockAddr) -> Result<()> {
        let f = self.table.getpeername.ok_or(IothError::Unsupported(Op::Getpeername))?;
        let (sa, len) = opt_addr(Some(addr));
        cvt(unsafe { f(fd, sa, len) }).map(drop)
    }

    fn setsockopt(&self, fd: RawFd, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
        let f = self.table.setsockopt.ok_or(IothError::Unsupported(Op::Setsockopt))?;
        cvt(unsafe {
            f(fd, level, name, value.as_ptr() as *const c_void, value.len() as socklen_t)
        })
        .map(drop)
    }

    fn getsockopt(&self, fd: RawFd, level: c_int, name: c_int, value: &mut [u8]) -> Result<usize> {
        let f = self.table.getsockopt.ok_or(IothError::Unsupported(Op::Getsockopt))?;
        let mut len = value.len() as socklen_t;
        cvt(unsafe { f(fd, level, name, value.as_mut_ptr() as *mut c_void, &mut len) })?;
        Ok(len as usize)
    }

    fn shutdown(&self, fd: RawFd, how: c_int) -> Result<()> {
        let f = self.table.shutdown.ok_or(IothError::Unsupported(Op::Shutdown))?;
        cvt(unsafe { f(fd, how) }).map(drop)
    }

    unsafe fn ioctl(&self, fd: RawFd, request: c_ulong, arg: *mut c_void) -> Result<c_int> {
        let f = self.table.ioctl.ok_or(IothError::Unsupported(Op::Ioctl))?;
        cvt(f(fd, request, arg))
    }

    fn fcntl(&self, fd: RawFd, cmd: c_int, arg: c_long) -> Result<c_int> {
        let f = self.table.fcntl.ok_or(IothError::Unsupported(Op::Fcntl))?;
        cvt(unsafe { f(fd, cmd, arg) })
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        match self.table.read {
            Some(f) => cvt_size(unsafe { f(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) }),
            None => derive::read(self, fd, buf),
        }
    }

    fn readv(&self, fd: RawFd, iov: &mut [IoSliceMut<'_>]) -> Result<usize> {
        match self.table.readv {
            Some(f) => cvt_size(unsafe { f(fd, iov.as_ptr() as *const iovec, iov.len() as c_int) }),
            None => derive::readv(self, fd, iov),
        }
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
        match self.table.recv {
            Some(f) => {
                cvt_size(unsafe { f(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) })
            }
            None => derive::recv(self, fd, buf, flags),
        }
    }

    fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: c_int,
        from: Option<&mut SockAddr>,
    ) -> Result<usize> {
        match self.table.recvfrom {
            Some(f) => {
                let (sa, len) = opt_addr(from);
                cvt_size(unsafe {
                    f(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags, sa, len)
                })
            }
            None => derive::recvfrom(self, fd, buf, flags, from),
        }
    }

    fn recvmsg(&self, fd: RawFd, msg: &mut RecvMsg<'_, '_>, flags: c_int) -> Result<usize> {
        let f = self.table.recvmsg.ok_or(IothError::Unsupported(Op::Recvmsg))?;
        msg.with_raw(|hdr| unsafe { f(fd, hdr, flags) })
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        match self.table.write {
            Some(f) => cvt_size(unsafe { f(fd, buf.as_ptr() as *const c_void, buf.len()) }),
            None => derive::write(self, fd, buf),
        }
    }

    fn writev(&self, fd: RawFd, iov: &[IoSlice<'_>]) -> Result<usize> {
        match self.table.writev {
            Some(f) => cvt_size(unsafe { f(fd, iov.as_ptr() as *const iovec, iov.len() as c_int) }),
            None => derive::writev(self, fd, iov),
        }
    }

    fn send(&self, fd: RawFd, buf: &[u8], flags: c_int) -> Result<usize> {
        match self.table.send {
            Some(f) => cvt_size(unsafe { f(fd, buf.as_ptr() as *const c_void, buf.len(), flags) }),
            None => derive::send(self, fd, buf, flags),
        }
    }

    fn sendto(&self, fd: RawFd, buf: &[u8], flags: c_int, to: Option<&SockAddr>) -> Result<usize> {
        match self.table.sendto {
            Some(f) => {
                let (sa, len) = match to {
                    Some(a) => (a.as_ptr(), a.len()),
                    None => (ptr::null(), 0),
                };
                cvt_size(unsafe {
                    f(fd, buf.as_ptr() as *const c_void, buf.len(), flags, sa, len)
                })
            }
            None => derive::sendto(self, fd, buf, flags, to),
        }
    }

    fn sendmsg(&self, fd: RawFd, msg: &SendMsg<'_, '_>, flags: c_int) -> Result<usize> {
        let f = self.table.sendmsg.ok_or(IothError::Unsupported(Op::Sendmsg))?;
        msg.with_raw(|hdr| unsafe { f(fd, hdr, flags) })
    }
}
