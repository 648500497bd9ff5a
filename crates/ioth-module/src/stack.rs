//! Stack instances and their lifecycle.
//!
//! ```text
//!            socket/accept          last close
//!   Idle ─────────────────▶ Active(n) ─────────▶ Idle
//!    │
//!    │ delete (count == 0)
//!    ▼
//!   Draining ──release ok──▶ Destroyed
//!    │
//!    └──release failed / racing open──▶ Idle
//! ```
//!
//! Open and destroy meet through two SeqCst atomics. Open bumps the
//! counter and then reads the phase; destroy sets `Draining` and then
//! reads the counter. At least one side sees the other, so a socket is
//! never created on a stack whose backend is being released.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use ioth_core::backend::StackBackend;
use ioth_core::error::{IothError, Result};

use crate::context;

/// Shared handle to a stack. Cloning does not create a new stack.
pub type StackHandle = Arc<Stack>;

const PHASE_OPEN: u8 = 0;
const PHASE_DRAINING: u8 = 1;
const PHASE_DESTROYED: u8 = 2;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Idle,
    Active(usize),
    Draining,
    Destroyed,
}

pub struct Stack {
    id: u64,
    backend: Box<dyn StackBackend>,
    sockets: AtomicUsize,
    phase: AtomicU8,
}

impl Stack {
    pub fn new(backend: Box<dyn StackBackend>) -> StackHandle {
        Arc::new(Stack {
            id: NEXT_ID.fetch_add(1, SeqCst),
            backend,
            sockets: AtomicUsize::new(0),
            phase: AtomicU8::new(PHASE_OPEN),
        })
    }

    /// Process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &dyn StackBackend {
        &*self.backend
    }

    /// Open sockets currently owned by this stack.
    pub fn socket_count(&self) -> usize {
        self.sockets.load(SeqCst)
    }

    pub fn state(&self) -> StackState {
        match self.phase.load(SeqCst) {
            PHASE_DRAINING => StackState::Draining,
            PHASE_DESTROYED => StackState::Destroyed,
            _ => match self.sockets.load(SeqCst) {
                0 => StackState::Idle,
                n => StackState::Active(n),
            },
        }
    }

    /// Publish this stack's context to the calling thread and return the
    /// backend to dispatch into.
    #[inline]
    pub(crate) fn enter(&self) -> &dyn StackBackend {
        context::set_stack_data(self.backend.stack_data());
        &*self.backend
    }

    /// Reserve a socket slot before calling the backend's `socket`.
    pub(crate) fn begin_open(&self) -> Result<()> {
        self.sockets.fetch_add(1, SeqCst);
        if self.phase.load(SeqCst) != PHASE_OPEN {
            self.sockets.fetch_sub(1, SeqCst);
            return Err(IothError::InvalidInput(format!(
                "stack {} is being destroyed",
                self.id
            )));
        }
        Ok(())
    }

    /// Give back a reservation whose `socket` failed.
    pub(crate) fn abort_open(&self) {
        self.sockets.fetch_sub(1, SeqCst);
    }

    /// Count a descriptor accepted on one of this stack's listeners.
    pub(crate) fn adopt(&self) {
        self.sockets.fetch_add(1, SeqCst);
    }

    /// A descriptor owned by this stack was closed.
    pub(crate) fn release_socket(&self) {
        self.sockets.fetch_sub(1, SeqCst);
    }

    /// Idle → Draining. `Busy` when sockets are open.
    pub(crate) fn begin_destroy(&self) -> Result<()> {
        if self
            .phase
            .compare_exchange(PHASE_OPEN, PHASE_DRAINING, SeqCst, SeqCst)
            .is_err()
        {
            return Err(IothError::InvalidInput(format!(
                "stack {} already destroyed or being destroyed",
                self.id
            )));
        }
        let open = self.sockets.load(SeqCst);
        if open != 0 {
            self.phase.store(PHASE_OPEN, SeqCst);
            return Err(IothError::Busy { sockets: open });
        }
        Ok(())
    }

    /// Draining → Destroyed on success, back to Idle otherwise.
    pub(crate) fn finish_destroy(&self, released: bool) {
        let phase = if released { PHASE_DESTROYED } else { PHASE_OPEN };
        self.phase.store(phase, SeqCst);
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("state", &self.state())
            .finish()
    }
}
