//! Message descriptors for `recvmsg` / `sendmsg`.
//!
//! These are the most expressive primitives (vectored I/O + addressing +
//! control data). Every narrower read/write primitive is a degenerate
//! message, which is what makes the derivations in [`crate::derive`]
//! lossless.
//!
//! `with_raw` lowers a message to a `libc::msghdr` for C-level callees
//! (the host stack, dynamically loaded plugins) and writes the kernel-style
//! out-parameters back afterwards.

use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::ptr;

use crate::error::{cvt_size, Result};
use crate::sockaddr::SockAddr;

/// Receive-side message.
///
/// After a successful receive, `name` (if any) holds the sender address
/// with its actual length, `control_len` the number of control bytes
/// written and `flags` the returned message flags.
pub struct RecvMsg<'a, 'b> {
    pub name: Option<&'a mut SockAddr>,
    pub iov: &'a mut [IoSliceMut<'b>],
    pub control: Option<&'a mut [u8]>,
    pub control_len: usize,
    pub flags: libc::c_int,
}

impl<'a, 'b> RecvMsg<'a, 'b> {
    /// Message with no name and no control buffer.
    pub fn new(iov: &'a mut [IoSliceMut<'b>]) -> Self {
        Self {
            name: None,
            iov,
            control: None,
            control_len: 0,
            flags: 0,
        }
    }

    pub fn with_name(mut self, name: Option<&'a mut SockAddr>) -> Self {
        self.name = name;
        self
    }

    pub fn with_control(mut self, control: &'a mut [u8]) -> Self {
        self.control = Some(control);
        self
    }

    /// Total capacity of the scatter vector.
    pub fn capacity(&self) -> usize {
        self.iov.iter().map(|s| s.len()).sum()
    }

    /// Scatter `data` across the vector; returns bytes copied.
    pub fn fill(&mut self, mut data: &[u8]) -> usize {
        let mut copied = 0;
        for slice in self.iov.iter_mut() {
            if data.is_empty() {
                break;
            }
            let n = slice.len().min(data.len());
            slice[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            copied += n;
        }
        copied
    }

    /// Lower to a `msghdr`, run `call`, then write back name length,
    /// control length and flags if the call succeeded.
    pub fn with_raw<F>(&mut self, call: F) -> Result<usize>
    where
        F: FnOnce(*mut libc::msghdr) -> libc::ssize_t,
    {
        // SAFETY: msghdr is plain old data; every pointer field is set below.
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        match self.name.as_deref_mut() {
            Some(name) => {
                hdr.msg_name = name.as_mut_ptr() as *mut libc::c_void;
                hdr.msg_namelen = name.len();
            }
            None => {
                hdr.msg_name = ptr::null_mut();
                hdr.msg_namelen = 0;
            }
        }
        // IoSliceMut is ABI compatible with iovec on Unix.
        hdr.msg_iov = self.iov.as_mut_ptr() as *mut libc::iovec;
        hdr.msg_iovlen = self.iov.len() as _;
        if let Some(control) = self.control.as_deref_mut() {
            hdr.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            hdr.msg_controllen = control.len() as _;
        }

        let ret = call(&mut hdr);
        let n = cvt_size(ret)?;

        if let Some(name) = self.name.as_deref_mut() {
            name.set_len(hdr.msg_namelen);
        }
        self.control_len = hdr.msg_controllen as usize;
        self.flags = hdr.msg_flags;
        Ok(n)
    }
}

/// Send-side message.
pub struct SendMsg<'a, 'b> {
    pub name: Option<&'a SockAddr>,
    pub iov: &'a [IoSlice<'b>],
    pub control: Option<&'a [u8]>,
}

impl<'a, 'b> SendMsg<'a, 'b> {
    pub fn new(iov: &'a [IoSlice<'b>]) -> Self {
        Self {
            name: None,
            iov,
            control: None,
        }
    }

    pub fn with_name(mut self, name: Option<&'a SockAddr>) -> Self {
        self.name = name;
        self
    }

    pub fn with_control(mut self, control: &'a [u8]) -> Self {
        self.control = Some(control);
        self
    }

    /// Total bytes carried by the gather vector.
    pub fn len(&self) -> usize {
        self.iov.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenate the gather vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for slice in self.iov {
            out.extend_from_slice(slice);
        }
        out
    }

    /// Lower to a `msghdr` and run `call`.
    pub fn with_raw<F>(&self, call: F) -> Result<usize>
    where
        F: FnOnce(*const libc::msghdr) -> libc::ssize_t,
    {
        // SAFETY: msghdr is plain old data; every pointer field is set below.
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(name) = self.name {
            hdr.msg_name = name.as_ptr() as *mut libc::c_void;
            hdr.msg_namelen = name.len();
        }
        // The callee only reads through these pointers.
        hdr.msg_iov = self.iov.as_ptr() as *mut libc::iovec;
        hdr.msg_iovlen = self.iov.len() as _;
        if let Some(control) = self.control {
            hdr.msg_control = control.as_ptr() as *mut libc::c_void;
            hdr.msg_controllen = control.len() as _;
        }
        cvt_size(call(&hdr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn fill_scatters_across_slices() {
        let mut a = [0u8; 3];
        let mut b = [0u8; 4];
        let mut iov = [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)];
        let mut msg = RecvMsg::new(&mut iov);
        assert_eq!(msg.capacity(), 7);
        assert_eq!(msg.fill(b"hello"), 5);
        drop(msg);
        assert_eq!(&a, b"hel");
        assert_eq!(&b[..2], b"lo");
    }

    #[test]
    fn recv_with_raw_writes_back_out_params() {
        let mut buf = [0u8; 8];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut from = SockAddr::empty();
        let mut msg = RecvMsg::new(&mut iov).with_name(Some(&mut from));

        let n = msg
            .with_raw(|hdr| unsafe {
                let hdr = &mut *hdr;
                assert_eq!(hdr.msg_namelen, SockAddr::CAPACITY);
                assert_eq!(hdr.msg_iovlen as usize, 1);
                hdr.msg_namelen = 16;
                hdr.msg_flags = libc::MSG_TRUNC;
                4
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(msg.flags, libc::MSG_TRUNC);
        drop(msg);
        assert_eq!(from.len(), 16);
    }

    #[test]
    fn recv_with_raw_failure_leaves_name_untouched() {
        let mut buf = [0u8; 8];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut from = SockAddr::empty();
        let mut msg = RecvMsg::new(&mut iov).with_name(Some(&mut from));
        let res = msg.with_raw(|hdr| unsafe {
            (*hdr).msg_namelen = 3;
            nix::errno::Errno::EAGAIN.set();
            -1
        });
        assert!(res.is_err());
        drop(msg);
        assert_eq!(from.len(), SockAddr::CAPACITY);
    }

    #[test]
    fn send_with_raw_exposes_name_and_vector() {
        let to = SockAddr::from("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        let iov = [IoSlice::new(b"ab"), IoSlice::new(b"cde")];
        let msg = SendMsg::new(&iov).with_name(Some(&to));
        assert_eq!(msg.to_vec(), b"abcde");
        let n = msg
            .with_raw(|hdr| unsafe {
                let hdr = &*hdr;
                assert_eq!(hdr.msg_namelen, to.len());
                assert_eq!(hdr.msg_iovlen as usize, 2);
                5
            })
            .unwrap();
        assert_eq!(n, 5);
    }
}
