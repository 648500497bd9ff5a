//! Scripted in-memory backend for registry tests.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use libc::{c_int, c_void};
use nix::errno::Errno;

use ioth_core::abi::{Op, OpSet};
use ioth_core::backend::StackBackend;
use ioth_core::error::{IothError, Result};
use ioth_core::msg::{RecvMsg, SendMsg};
use ioth_core::sockaddr::SockAddr;

use crate::context;

/// Fake descriptors start far above anything the kernel hands out in tests.
static NEXT_FD: AtomicI32 = AtomicI32::new(100_000);

#[derive(Default)]
pub(crate) struct MockState {
    pub fail_socket: AtomicBool,
    pub fail_close: AtomicBool,
    pub fail_release: AtomicBool,
    pub queue: Mutex<VecDeque<(Vec<u8>, Option<SockAddr>)>>,
    pub calls: Mutex<Vec<Op>>,
    /// Context slot value observed by the last native call.
    pub seen_context: Mutex<Option<usize>>,
    /// Next `close` meets this barrier twice: once on entry, once before
    /// returning.
    pub close_hold: Mutex<Option<Arc<Barrier>>>,
}

impl MockState {
    pub fn calls(&self) -> Vec<Op> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: Op) {
        self.calls.lock().unwrap().push(op);
        *self.seen_context.lock().unwrap() = Some(context::stack_data() as usize);
    }
}

/// Message-only stack: socket, close, listen, accept, recvmsg, sendmsg.
pub(crate) struct MockStack {
    pub state: Arc<MockState>,
    data: Box<u64>,
}

impl MockStack {
    pub fn new() -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (Self::with_state(state.clone()), state)
    }

    pub fn with_state(state: Arc<MockState>) -> Self {
        MockStack {
            state,
            data: Box::new(0x5eed),
        }
    }

    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

impl StackBackend for MockStack {
    fn name(&self) -> &str {
        "mock"
    }

    fn native_ops(&self) -> OpSet {
        [Op::Socket, Op::Close, Op::Listen, Op::Accept, Op::Recvmsg, Op::Sendmsg]
            .into_iter()
            .collect()
    }

    fn stack_data(&self) -> *mut c_void {
        &*self.data as *const u64 as *mut c_void
    }

    fn release(&self) -> Result<()> {
        if Self::take(&self.state.fail_release) {
            return Err(IothError::Backend(Errno::EAGAIN));
        }
        Ok(())
    }

    fn socket(&self, _domain: c_int, _ty: c_int, _protocol: c_int) -> Result<RawFd> {
        self.state.record(Op::Socket);
        if Self::take(&self.state.fail_socket) {
            return Err(IothError::Os(Errno::EMFILE));
        }
        Ok(NEXT_FD.fetch_add(1, Ordering::SeqCst))
    }

    fn close(&self, _fd: RawFd) -> Result<()> {
        self.state.record(Op::Close);
        let hold = self.state.close_hold.lock().unwrap().take();
        if let Some(gate) = hold {
            gate.wait();
            gate.wait();
        }
        if Self::take(&self.state.fail_close) {
            return Err(IothError::Os(Errno::EINTR));
        }
        Ok(())
    }

    fn listen(&self, _fd: RawFd, _backlog: c_int) -> Result<()> {
        self.state.record(Op::Listen);
        Ok(())
    }

    fn accept(&self, _fd: RawFd, addr: Option<&mut SockAddr>) -> Result<RawFd> {
        self.state.record(Op::Accept);
        if let Some(addr) = addr {
            *addr = SockAddr::from(std::net::SocketAddr::from(([10, 0, 0, 2], 40000)));
        }
        Ok(NEXT_FD.fetch_add(1, Ordering::SeqCst))
    }

    fn recvmsg(&self, _fd: RawFd, msg: &mut RecvMsg<'_, '_>, _flags: c_int) -> Result<usize> {
        self.state.record(Op::Recvmsg);
        let (data, from) = self
            .state
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(IothError::Os(Errno::EAGAIN))?;
        if let (Some(name), Some(from)) = (msg.name.as_deref_mut(), from) {
            *name = from;
        }
        Ok(msg.fill(&data))
    }

    fn sendmsg(&self, _fd: RawFd, msg: &SendMsg<'_, '_>, _flags: c_int) -> Result<usize> {
        self.state.record(Op::Sendmsg);
        self.state
            .queue
            .lock()
            .unwrap()
            .push_back((msg.to_vec(), msg.name.copied()));
        Ok(msg.len())
    }
}
