//! Descriptor ownership table.
//!
//! The table lock is only held for map updates, never across a backend
//! call. `close` marks its entry as closing, runs the backend's close
//! unlocked, then settles the entry:
//!
//! ```text
//!   lock: mark closing ─▶ unlock: backend close ─▶ lock: remove | unmark
//! ```
//!
//! Entries carry a generation, so a close that finishes after the kernel
//! already reused the number (and `insert` replaced the closing entry)
//! leaves the new owner alone.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use ioth_core::abi::Op;
use ioth_core::error::{IothError, Result};

use crate::stack::StackHandle;

#[derive(Debug)]
struct Entry {
    stack: StackHandle,
    generation: u64,
    closing: bool,
}

/// Maps every open descriptor to the stack that created it.
#[derive(Debug, Default)]
pub struct FdTable {
    owners: RwLock<HashMap<RawFd, Entry>>,
    generation: AtomicU64,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, fd: RawFd) -> Option<StackHandle> {
        self.owners.read().get(&fd).map(|e| e.stack.clone())
    }

    /// Owner of `fd`, or `BadDescriptor`.
    pub fn owner(&self, fd: RawFd) -> Result<StackHandle> {
        self.lookup(fd).ok_or(IothError::BadDescriptor(fd))
    }

    /// Record `fd` as owned by `stack`.
    ///
    /// An entry that is being closed is replaced silently: the number was
    /// reused, and the pending close settles its own count. Any other
    /// existing entry means the descriptor was closed behind the
    /// registry's back; its old owner stops counting it.
    pub fn insert(&self, fd: RawFd, stack: StackHandle) {
        let entry = Entry {
            stack,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            closing: false,
        };
        match self.owners.write().insert(fd, entry) {
            Some(old) if old.closing => {
                debug!(fd, stack = old.stack.id(), "descriptor reused while its close completes");
            }
            Some(stale) => {
                warn!(
                    fd,
                    stack = stale.stack.id(),
                    "descriptor reused without close; dropping stale owner"
                );
                stale.stack.release_socket();
            }
            None => {}
        }
    }

    /// Run `close` on the owner of `fd` and forget the descriptor only if
    /// it succeeds.
    ///
    /// The table is not locked while `close` runs. An unknown descriptor
    /// is `Unsupported(close)`; one already being closed by another thread
    /// is `BadDescriptor`.
    pub fn close_with<F>(&self, fd: RawFd, close: F) -> Result<()>
    where
        F: FnOnce(&StackHandle) -> Result<()>,
    {
        let (stack, generation) = {
            let mut owners = self.owners.write();
            let entry = owners
                .get_mut(&fd)
                .ok_or(IothError::Unsupported(Op::Close))?;
            if entry.closing {
                return Err(IothError::BadDescriptor(fd));
            }
            entry.closing = true;
            (entry.stack.clone(), entry.generation)
        };

        let result = close(&stack);

        let mut owners = self.owners.write();
        let ours = owners.get(&fd).is_some_and(|e| e.generation == generation);
        match result {
            Ok(()) => {
                if ours {
                    owners.remove(&fd);
                }
                drop(owners);
                stack.release_socket();
                Ok(())
            }
            Err(error) => {
                if ours {
                    if let Some(entry) = owners.get_mut(&fd) {
                        entry.closing = false;
                    }
                } else {
                    // Replaced while closing; the old count goes with it.
                    drop(owners);
                    warn!(fd, stack = stack.id(), "close failed after descriptor reuse");
                    stack.release_socket();
                }
                Err(error)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.owners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.read().is_empty()
    }

    /// Descriptors owned by `stack`.
    pub fn count_owned_by(&self, stack: &StackHandle) -> usize {
        self.owners
            .read()
            .values()
            .filter(|e| Arc::ptr_eq(&e.stack, stack))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostStack;
    use crate::stack::Stack;
    use nix::errno::Errno;

    fn stack() -> StackHandle {
        Stack::new(Box::new(HostStack::new()))
    }

    fn owned(t: &FdTable, fd: RawFd, s: &StackHandle) {
        s.begin_open().unwrap();
        t.insert(fd, s.clone());
    }

    #[test]
    fn unknown_descriptor() {
        let t = FdTable::new();
        assert!(matches!(t.owner(9), Err(IothError::BadDescriptor(9))));
        assert!(matches!(
            t.close_with(9, |_| Ok(())),
            Err(IothError::Unsupported(Op::Close))
        ));
    }

    #[test]
    fn failed_close_keeps_ownership() {
        let t = FdTable::new();
        let s = stack();
        owned(&t, 4, &s);

        let err = t.close_with(4, |_| Err(IothError::Os(Errno::EINTR))).unwrap_err();
        assert!(matches!(err, IothError::Os(Errno::EINTR)));
        assert!(Arc::ptr_eq(&t.owner(4).unwrap(), &s));
        assert_eq!(s.socket_count(), 1);

        t.close_with(4, |_| Ok(())).unwrap();
        assert!(t.lookup(4).is_none());
        assert_eq!(s.socket_count(), 0);
    }

    #[test]
    fn stale_entry_is_replaced() {
        let t = FdTable::new();
        let (a, b) = (stack(), stack());
        owned(&t, 5, &a);
        owned(&t, 5, &b);
        assert!(Arc::ptr_eq(&t.owner(5).unwrap(), &b));
        assert_eq!(a.socket_count(), 0);
        assert_eq!(t.count_owned_by(&a), 0);
        assert_eq!(t.count_owned_by(&b), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn table_usable_while_close_runs() {
        let t = FdTable::new();
        let (a, b) = (stack(), stack());
        owned(&t, 6, &a);
        owned(&t, 7, &b);

        t.close_with(6, |_| {
            // Lookups, inserts and closes of other descriptors all proceed.
            assert!(Arc::ptr_eq(&t.owner(7).unwrap(), &b));
            assert!(Arc::ptr_eq(&t.owner(6).unwrap(), &a));
            owned(&t, 8, &b);
            t.close_with(8, |_| Ok(())).unwrap();
            Ok(())
        })
        .unwrap();
        assert!(t.lookup(6).is_none());
        assert_eq!(b.socket_count(), 1);
    }

    #[test]
    fn concurrent_close_of_same_descriptor() {
        let t = FdTable::new();
        let s = stack();
        owned(&t, 10, &s);
        t.close_with(10, |_| {
            assert!(matches!(
                t.close_with(10, |_| Ok(())),
                Err(IothError::BadDescriptor(10))
            ));
            Ok(())
        })
        .unwrap();
        assert_eq!(s.socket_count(), 0);
        assert!(t.is_empty());
    }

    #[test]
    fn reuse_during_close_keeps_new_owner() {
        let t = FdTable::new();
        let (a, b) = (stack(), stack());
        owned(&t, 11, &a);
        t.close_with(11, |_| {
            // The number is handed out again before the close settles.
            owned(&t, 11, &b);
            Ok(())
        })
        .unwrap();
        assert!(Arc::ptr_eq(&t.owner(11).unwrap(), &b));
        assert_eq!(a.socket_count(), 0);
        assert_eq!(b.socket_count(), 1);
    }
}
