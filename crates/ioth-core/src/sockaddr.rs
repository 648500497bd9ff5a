//! Owned socket address buffer.
//!
//! `SockAddr` is a `sockaddr_storage` plus a length. The length is in/out
//! in the Berkeley sense: before a call that fills the address it is the
//! capacity offered, afterwards it is the length the stack reported.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    pub const CAPACITY: libc::socklen_t =
        mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    /// Empty buffer offering its full capacity, ready to be filled.
    pub fn empty() -> Self {
        Self {
            // SAFETY: sockaddr_storage is plain old data.
            storage: unsafe { mem::zeroed() },
            len: Self::CAPACITY,
        }
    }

    /// Copy `len` bytes of a raw address. `len` is clamped to capacity.
    ///
    /// # Safety
    /// `addr` must be valid for reads of `len` bytes (or null with `len == 0`).
    pub unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Self {
        let mut out = Self::empty();
        let len = len.min(Self::CAPACITY);
        if !addr.is_null() && len > 0 {
            std::ptr::copy_nonoverlapping(
                addr as *const u8,
                &mut out.storage as *mut _ as *mut u8,
                len as usize,
            );
        }
        out.len = len;
        out
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    #[inline]
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the length, clamped to capacity.
    #[inline]
    pub fn set_len(&mut self, len: libc::socklen_t) {
        self.len = len.min(Self::CAPACITY);
    }

    /// Pointer to the in/out length, for C calls that update it.
    #[inline]
    pub fn len_mut(&mut self) -> &mut libc::socklen_t {
        &mut self.len
    }

    /// Bytes of the address that are currently valid.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: storage is CAPACITY bytes and len <= CAPACITY.
        unsafe { std::slice::from_raw_parts(self.as_ptr() as *const u8, self.len as usize) }
    }

    pub fn family(&self) -> libc::sa_family_t {
        self.storage.ss_family
    }

    /// Interpret as an IP socket address, if it is one.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self.family() as libc::c_int {
            libc::AF_INET if self.len as usize >= mem::size_of::<libc::sockaddr_in>() => {
                // SAFETY: family and length checked.
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 if self.len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
                // SAFETY: family and length checked.
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        let mut out = Self::empty();
        match addr {
            SocketAddr::V4(v4) => {
                // SAFETY: storage is large enough and suitably aligned.
                let sin = unsafe { &mut *(out.as_mut_ptr() as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                out.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                // SAFETY: as above.
                let sin6 = unsafe { &mut *(out.as_mut_ptr() as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                out.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }
        out
    }
}

impl PartialEq for SockAddr {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SockAddr {}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_socket_addr() {
            Some(sa) => write!(f, "SockAddr({})", sa),
            None => f
                .debug_struct("SockAddr")
                .field("family", &self.family())
                .field("len", &self.len)
                .finish(),
        }
    }
}
