//! Operation set of the stack ABI.
//!
//! Every backend exposes some subset of the Berkeley socket primitives
//! listed in [`Op`]. The set a backend implements natively is an [`OpSet`];
//! the set it exposes to callers is larger, because narrow I/O primitives
//! are derived from the message primitives (see [`crate::derive`]).
//!
//! The derivation edges are data here so that the registry can report,
//! for any backend, what is native and what is synthesized:
//!
//! ```text
//! read  ─▶ recv  ─▶ recvfrom ─▶ recvmsg      readv  ─▶ recvmsg
//! write ─▶ send  ─▶ sendto   ─▶ sendmsg      writev ─▶ sendmsg
//! ```

use std::fmt;

/// Socket primitive a backend may implement.
///
/// Declaration order matches the slot order of the C plugin table
/// (after the `getstackdata`, `newstack`, `delstack` lifecycle slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Op {
    Socket = 0,
    Close,
    Bind,
    Connect,
    Listen,
    Accept,
    Getsockname,
    Getpeername,
    Setsockopt,
    Getsockopt,
    Shutdown,
    Ioctl,
    Fcntl,
    Read,
    Readv,
    Recv,
    Recvfrom,
    Recvmsg,
    Write,
    Writev,
    Send,
    Sendto,
    Sendmsg,
}

impl Op {
    /// All primitives, in slot order.
    pub const ALL: [Op; 23] = [
        Op::Socket,
        Op::Close,
        Op::Bind,
        Op::Connect,
        Op::Listen,
        Op::Accept,
        Op::Getsockname,
        Op::Getpeername,
        Op::Setsockopt,
        Op::Getsockopt,
        Op::Shutdown,
        Op::Ioctl,
        Op::Fcntl,
        Op::Read,
        Op::Readv,
        Op::Recv,
        Op::Recvfrom,
        Op::Recvmsg,
        Op::Write,
        Op::Writev,
        Op::Send,
        Op::Sendto,
        Op::Sendmsg,
    ];

    /// Symbol suffix used by plugins (`ioth_<stack>_<name>`).
    pub const fn name(self) -> &'static str {
        match self {
            Op::Socket => "socket",
            Op::Close => "close",
            Op::Bind => "bind",
            Op::Connect => "connect",
            Op::Listen => "listen",
            Op::Accept => "accept",
            Op::Getsockname => "getsockname",
            Op::Getpeername => "getpeername",
            Op::Setsockopt => "setsockopt",
            Op::Getsockopt => "getsockopt",
            Op::Shutdown => "shutdown",
            Op::Ioctl => "ioctl",
            Op::Fcntl => "fcntl",
            Op::Read => "read",
            Op::Readv => "readv",
            Op::Recv => "recv",
            Op::Recvfrom => "recvfrom",
            Op::Recvmsg => "recvmsg",
            Op::Write => "write",
            Op::Writev => "writev",
            Op::Send => "send",
            Op::Sendto => "sendto",
            Op::Sendmsg => "sendmsg",
        }
    }

    /// The more general primitive this one is derived from when the
    /// backend leaves it unbound. `None` means the primitive is terminal:
    /// unbound ⇒ not supported.
    pub const fn fallback(self) -> Option<Op> {
        match self {
            Op::Read => Some(Op::Recv),
            Op::Recv => Some(Op::Recvfrom),
            Op::Recvfrom => Some(Op::Recvmsg),
            Op::Readv => Some(Op::Recvmsg),
            Op::Write => Some(Op::Send),
            Op::Send => Some(Op::Sendto),
            Op::Sendto => Some(Op::Sendmsg),
            Op::Writev => Some(Op::Sendmsg),
            _ => None,
        }
    }

    #[inline]
    const fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit set of [`Op`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpSet(u32);

impl OpSet {
    pub const EMPTY: OpSet = OpSet(0);

    /// Every primitive.
    pub const FULL: OpSet = OpSet((1 << Op::ALL.len()) - 1);

    /// Minimal set that still exposes the whole surface once derived.
    pub const MINIMAL: OpSet = OpSet::EMPTY
        .with(Op::Socket)
        .with(Op::Close)
        .with(Op::Recvmsg)
        .with(Op::Sendmsg);

    pub const fn with(self, op: Op) -> OpSet {
        OpSet(self.0 | op.bit())
    }

    pub fn insert(&mut self, op: Op) {
        self.0 |= op.bit();
    }

    pub const fn contains(self, op: Op) -> bool {
        self.0 & op.bit() != 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Op> {
        Op::ALL.into_iter().filter(move |op| self.contains(*op))
    }

    /// How a call to `op` is served given this native set: the first
    /// primitive along the fallback chain that is bound, if any.
    pub fn resolve(self, op: Op) -> Option<Op> {
        let mut cur = op;
        loop {
            if self.contains(cur) {
                return Some(cur);
            }
            cur = cur.fallback()?;
        }
    }

    /// Native primitives plus everything derivable from them.
    pub fn reachable(self) -> OpSet {
        Op::ALL
            .into_iter()
            .filter(|op| self.resolve(*op).is_some())
            .collect()
    }
}

impl FromIterator<Op> for OpSet {
    fn from_iter<I: IntoIterator<Item = Op>>(iter: I) -> Self {
        let mut set = OpSet::EMPTY;
        for op in iter {
            set.insert(op);
        }
        set
    }
}

impl fmt::Debug for OpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
