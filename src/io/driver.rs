//! Platform completion adapters behind one contract.
//!
//! Two structurally different mechanisms implement [`Driver`]: a submission
//! queue (Linux io_uring) and a completion port (Windows IOCP). The device
//! layer never sees the difference — it submits a [`Transfer`], gets back an
//! [`OpToken`], and the adapter delivers exactly one completion per started
//! operation on the event-loop thread.

pub(crate) mod op_registry;

use crate::buffer::BufferShared;
use crate::error::SubmitError;
use crate::io::SysHandle;
use std::io;
use std::rc::Rc;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferKind {
    Read,
    Write,
}

/// One asynchronous operation handed to the adapter.
///
/// `ptr`/`len` reference the buffer's payload; the `buffer` reference keeps
/// that memory alive in the adapter's registry until the kernel completion
/// arrives, regardless of what the application does in between.
pub(crate) struct Transfer {
    pub kind: TransferKind,
    pub handle: SysHandle,
    pub offset: u64,
    pub ptr: *mut u8,
    pub len: usize,
    pub buffer: Rc<BufferShared>,
}

/// Generation-checked correlation token.
///
/// Packs a registry slot index and its generation into the native 64-bit
/// user-data field, so a completion for a reused or stale slot can never be
/// misattributed to the wrong buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpToken {
    index: u32,
    generation: u32,
}

impl OpToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    pub(crate) fn into_user_data(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_user_data(user_data: u64) -> Self {
        Self {
            index: user_data as u32,
            generation: (user_data >> 32) as u32,
        }
    }
}

pub(crate) trait Driver {
    /// Associate a freshly opened handle with the completion source.
    /// Required on completion-port platforms; a no-op elsewhere.
    fn register_handle(&mut self, handle: SysHandle) -> io::Result<()>;

    /// Submit a transfer. Non-blocking and capacity-limited: a full
    /// submission queue is reported as `SubmitError::QueueFull` and nothing
    /// is started.
    fn submit_transfer(&mut self, transfer: Transfer) -> Result<OpToken, SubmitError>;

    /// Request cancellation of an in-flight operation. Best-effort: the
    /// operation may still complete with data. Returns `false` when the
    /// cancellation itself could not be queued (caller retries).
    fn cancel(&mut self, token: OpToken) -> bool;

    /// Detach an in-flight operation from its buffer. The registry entry
    /// (and the payload it keeps alive) survives until the kernel completion
    /// arrives, then is dropped without touching the buffer.
    fn orphan(&mut self, token: OpToken);

    /// Flush queued submissions to the kernel.
    fn submit(&mut self) -> io::Result<()>;

    /// Block until at least one completion is available, then dispatch.
    /// Returns immediately when nothing is in flight.
    fn wait(&mut self) -> io::Result<()>;

    /// Dispatch all currently available completions without blocking.
    /// Returns the number of buffer completions delivered.
    fn process_completions(&mut self) -> usize;

    fn has_inflight(&self) -> bool;
}

#[cfg(target_os = "linux")]
pub(crate) mod uring;

#[cfg(target_os = "linux")]
pub(crate) use uring::UringDriver as PlatformDriver;

#[cfg(target_os = "windows")]
pub(crate) mod iocp;

#[cfg(target_os = "windows")]
pub(crate) use iocp::IocpDriver as PlatformDriver;
