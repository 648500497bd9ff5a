//! # ioth-core — types and traits for a pluggable networking stack
//!
//! This crate defines what a networking stack backend is and how the
//! narrow socket primitives are synthesized from the general ones. It
//! has no global state and loads nothing; the registry, the loader and
//! the host backend live in `ioth-module`.
//!
//! ## Layout
//!
//! ```text
//!   abi       Op / OpSet: the primitive set and its derivation edges
//!   backend   StackBackend: one stack instance, default-method derivations
//!   derive    the derivation functions themselves
//!   msg       recvmsg / sendmsg descriptors (+ msghdr lowering)
//!   sockaddr  owned sockaddr_storage + in/out length
//!   spec      "name,options" and "ifname=endpoint" parsing
//!   license   SPDX compatibility gate for loadable backends
//!   env       environment helpers for loader configuration
//!   error     IothError → errno
//! ```

pub mod abi;
pub mod backend;
pub mod derive;
pub mod env;
pub mod error;
pub mod license;
pub mod msg;
pub mod sockaddr;
pub mod spec;

pub use abi::{Op, OpSet};
pub use backend::StackBackend;
pub use error::{IothError, Result};
pub use msg::{RecvMsg, SendMsg};
pub use sockaddr::SockAddr;
pub use spec::{InterfaceSpec, StackSpec};
