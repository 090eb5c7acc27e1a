//! io_uring adapter.
//!
//! Each transfer becomes one read/write SQE tagged with the buffer's
//! [`OpToken`]; the CQE carries the token back and a negative result encodes
//! the errno. Cancellation is itself a submission (`AsyncCancel` by token)
//! and can fail when the ring is full.

use crate::buffer::BufferShared;
use crate::config::Config;
use crate::error::{SubmitError, TransferError};
use crate::io::driver::op_registry::OpRegistry;
use crate::io::driver::{Driver, OpToken, Transfer, TransferKind};
use crate::io::SysHandle;
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, trace};

/// CQEs with this user_data are confirmations of our cancel requests; they
/// carry no buffer identity and are skipped.
const CANCEL_USER_DATA: u64 = u64::MAX - 1;

struct OpEntry {
    buffer: Rc<BufferShared>,
    /// Set when the device was closed under the operation. The entry stays
    /// until the CQE arrives (the kernel still owns the payload pointer),
    /// then is dropped without completing the buffer.
    orphaned: bool,
}

pub(crate) struct UringDriver {
    ring: IoUring,
    ops: OpRegistry<OpEntry>,
    /// In-flight operations are capped at the ring size so exhaustion is a
    /// distinguishable, retryable condition rather than unbounded queueing.
    capacity: usize,
}

impl UringDriver {
    pub(crate) fn new(config: &Config) -> io::Result<Self> {
        let entries = config.uring.entries;
        let ring = IoUring::builder()
            .setup_coop_taskrun() // kernel 5.19+
            .setup_single_issuer() // kernel 6.0+; submission stays on one thread
            .build(entries)
            .or_else(|e| {
                // Older kernels reject the flags with EINVAL; retry plain.
                if e.raw_os_error() == Some(libc::EINVAL) {
                    IoUring::new(entries)
                } else {
                    Err(e)
                }
            })?;

        debug!("initialized uring driver with {} entries", entries);

        Ok(Self {
            ring,
            ops: OpRegistry::with_capacity(entries as usize),
            capacity: entries as usize,
        })
    }

    /// Try to push an entry to the submission queue, flushing once when the
    /// queue is full. Returns false when no slot could be made available.
    fn push_entry(&mut self, entry: squeue::Entry) -> bool {
        let mut sq = self.ring.submission();
        if unsafe { sq.push(&entry) }.is_ok() {
            return true;
        }

        drop(sq);
        let _ = self.ring.submit();

        let mut sq = self.ring.submission();
        if unsafe { sq.push(&entry) }.is_ok() {
            return true;
        }

        debug!("submission queue full even after flush");
        false
    }
}

impl Driver for UringDriver {
    fn register_handle(&mut self, _handle: SysHandle) -> io::Result<()> {
        // io_uring addresses operations by fd; nothing to associate.
        Ok(())
    }

    fn submit_transfer(&mut self, transfer: Transfer) -> Result<OpToken, SubmitError> {
        if self.ops.len() >= self.capacity {
            return Err(SubmitError::QueueFull);
        }

        let fd = types::Fd(transfer.handle as RawFd);
        let token = self.ops.insert(OpEntry {
            buffer: transfer.buffer,
            orphaned: false,
        });

        let sqe = match transfer.kind {
            TransferKind::Read => {
                opcode::Read::new(fd, transfer.ptr, transfer.len as u32)
                    .offset(transfer.offset)
                    .build()
            }
            TransferKind::Write => {
                opcode::Write::new(fd, transfer.ptr as *const u8, transfer.len as u32)
                    .offset(transfer.offset)
                    .build()
            }
        }
        .user_data(token.into_user_data());

        if !self.push_entry(sqe) {
            self.ops.remove(token);
            return Err(SubmitError::QueueFull);
        }

        trace!(
            "submitted {:?} len={} offset={} user_data={}",
            transfer.kind,
            transfer.len,
            transfer.offset,
            token.into_user_data()
        );
        Ok(token)
    }

    fn cancel(&mut self, token: OpToken) -> bool {
        if !self.ops.contains(token) {
            // Already completed; nothing left to cancel.
            return true;
        }

        let sqe = opcode::AsyncCancel::new(token.into_user_data())
            .build()
            .user_data(CANCEL_USER_DATA);

        if self.push_entry(sqe) {
            debug!("cancel requested for user_data={}", token.into_user_data());
            true
        } else {
            false
        }
    }

    fn orphan(&mut self, token: OpToken) {
        if let Some(entry) = self.ops.get_mut(token) {
            entry.orphaned = true;
        }
    }

    fn submit(&mut self) -> io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    fn wait(&mut self) -> io::Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }

        // Check the userspace queue before issuing a syscall to wait.
        if !self.ring.completion().is_empty() {
            self.process_completions();
            return Ok(());
        }

        self.ring.submit_and_wait(1)?;
        self.process_completions();
        Ok(())
    }

    fn process_completions(&mut self) -> usize {
        let mut delivered = 0;

        let mut cq = self.ring.completion();
        cq.sync();

        for cqe in cq {
            let user_data = cqe.user_data();
            if user_data == CANCEL_USER_DATA {
                continue;
            }

            let token = OpToken::from_user_data(user_data);
            let Some(entry) = self.ops.remove(token) else {
                // Stale or unknown completion; generation check filtered it.
                continue;
            };

            let result = cqe.result();
            let outcome = if result >= 0 {
                Ok(result as usize)
            } else if -result == libc::ECANCELED {
                Err(TransferError::Cancelled)
            } else {
                Err(TransferError::Os(-result))
            };

            trace!("completion user_data={} result={}", user_data, result);

            if entry.orphaned {
                // Device was closed under this operation; drop silently.
                continue;
            }
            entry.buffer.complete(outcome);
            delivered += 1;
        }

        delivered
    }

    fn has_inflight(&self) -> bool {
        !self.ops.is_empty()
    }
}
