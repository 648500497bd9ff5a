//! ioth error types.
//!
//! Every failure is reported synchronously to the immediate caller and
//! maps onto an errno, so the C-flavoured surface can keep the
//! `-1` + `errno` convention while Rust callers match on the variant.

use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::abi::Op;

#[derive(Debug, Error)]
pub enum IothError {
    /// The primitive and every fallback in its derivation chain are unbound.
    #[error("operation not supported by stack: {0}")]
    Unsupported(Op),

    /// The descriptor has no recorded owner.
    #[error("bad descriptor {0}: not owned by any stack")]
    BadDescriptor(RawFd),

    /// Destroy requested while sockets are still open on the stack.
    #[error("stack busy: {sockets} open socket(s)")]
    Busy { sockets: usize },

    /// No candidate module file could be loaded.
    #[error("stack module not found: {name}")]
    ModuleNotFound { name: String },

    /// The module loaded but lacks a mandatory symbol.
    #[error("stack module lacks entry point {symbol}")]
    MissingEntryPoint { symbol: String },

    /// The backend refused to create or delete its stack.
    #[error("backend failure: {0}")]
    Backend(Errno),

    /// The license gate denied loading the backend.
    #[error("license of backend {backend:?} not compatible with caller license {caller:?}")]
    LicenseDenied {
        caller: Option<String>,
        backend: String,
    },

    /// Allocation failure while constructing a stack.
    #[error("out of memory")]
    OutOfMemory,

    /// Malformed argument (stack spec, handle, …).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A bound primitive failed.
    #[error("{0}")]
    Os(Errno),
}

impl IothError {
    /// errno equivalent of this error.
    pub fn errno(&self) -> Errno {
        match self {
            IothError::Unsupported(_) => Errno::ENOSYS,
            IothError::BadDescriptor(_) => Errno::EBADF,
            IothError::Busy { .. } => Errno::EBUSY,
            IothError::ModuleNotFound { .. } => Errno::ENOTSUP,
            IothError::MissingEntryPoint { .. } => Errno::ENOENT,
            IothError::Backend(e) => *e,
            IothError::LicenseDenied { .. } => Errno::ENOTSUP,
            IothError::OutOfMemory => Errno::ENOMEM,
            IothError::InvalidInput(_) => Errno::EINVAL,
            IothError::Os(e) => *e,
        }
    }

    /// Capture `errno` after a failed C-level call.
    pub fn last_os() -> Self {
        IothError::Os(Errno::last())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, IothError::Unsupported(_))
    }

    /// Report an `Unsupported` raised further down a derivation chain
    /// under the operation the caller actually asked for.
    pub fn surface_as(self, op: Op) -> Self {
        match self {
            IothError::Unsupported(_) => IothError::Unsupported(op),
            other => other,
        }
    }
}

impl From<Errno> for IothError {
    fn from(e: Errno) -> Self {
        IothError::Os(e)
    }
}

impl From<IothError> for io::Error {
    fn from(e: IothError) -> Self {
        let kind = io::Error::from_raw_os_error(e.errno() as i32).kind();
        io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, IothError>;

/// Turn a `-1`/`errno` style return into a `Result`.
#[inline]
pub fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(IothError::last_os())
    } else {
        Ok(ret)
    }
}

/// Like [`cvt`] for `ssize_t` returns.
#[inline]
pub fn cvt_size(ret: libc::ssize_t) -> Result<usize> {
    if ret < 0 {
        Err(IothError::last_os())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(IothError::Unsupported(Op::Recvmsg).errno(), Errno::ENOSYS);
        assert_eq!(IothError::BadDescriptor(7).errno(), Errno::EBADF);
        assert_eq!(IothError::Busy { sockets: 2 }.errno(), Errno::EBUSY);
        assert_eq!(
            IothError::ModuleNotFound { name: "picox".into() }.errno(),
            Errno::ENOTSUP
        );
        assert_eq!(
            IothError::MissingEntryPoint { symbol: "ioth_x_newstack".into() }.errno(),
            Errno::ENOENT
        );
        assert_eq!(IothError::Backend(Errno::EPERM).errno(), Errno::EPERM);
        assert_eq!(IothError::OutOfMemory.errno(), Errno::ENOMEM);
    }

    #[test]
    fn surface_as_renames_only_unsupported() {
        let e = IothError::Unsupported(Op::Recvmsg).surface_as(Op::Read);
        assert!(matches!(e, IothError::Unsupported(Op::Read)));

        let e = IothError::Os(Errno::EAGAIN).surface_as(Op::Read);
        assert!(matches!(e, IothError::Os(Errno::EAGAIN)));
    }

    #[test]
    fn io_error_conversion_keeps_kind() {
        let io: io::Error = IothError::BadDescriptor(3).into();
        assert_eq!(io.kind(), io::Error::from_raw_os_error(libc::EBADF).kind());
        assert!(io.to_string().contains("bad descriptor 3"));
    }

    #[test]
    fn display_names_operation() {
        let e = IothError::Unsupported(Op::Sendto);
        assert_eq!(e.to_string(), "operation not supported by stack: sendto");
    }
}
