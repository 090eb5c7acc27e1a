//! I/O completion port adapter.
//!
//! Every in-flight operation owns a heap-pinned `OVERLAPPED` block carrying
//! its [`OpToken`]; the port returns the block pointer and the token is read
//! back out of it, then generation-checked against the registry before any
//! buffer is touched. Offsets travel in the OVERLAPPED offset fields.

use crate::buffer::BufferShared;
use crate::config::Config;
use crate::error::{SubmitError, TransferError};
use crate::io::driver::op_registry::OpRegistry;
use crate::io::driver::{Driver, OpToken, Transfer, TransferKind};
use crate::io::SysHandle;
use std::io;
use std::rc::Rc;
use tracing::{debug, trace, warn};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_HANDLE_EOF, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED,
    HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

/// OVERLAPPED must come first so the pointer handed back by the port can be
/// cast to the containing block.
#[repr(C)]
struct OverlappedBlock {
    inner: OVERLAPPED,
    user_data: u64,
}

struct OpEntry {
    buffer: Rc<BufferShared>,
    handle: HANDLE,
    /// Keeps the OVERLAPPED address stable while the kernel references it.
    overlapped: Box<OverlappedBlock>,
    /// Device closed under the operation; drop the late completion silently.
    orphaned: bool,
}

pub(crate) struct IocpDriver {
    port: HANDLE,
    ops: OpRegistry<OpEntry>,
    capacity: usize,
}

impl IocpDriver {
    pub(crate) fn new(config: &Config) -> io::Result<Self> {
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }

        let entries = config.iocp.entries;
        debug!("initialized iocp driver with {} entries", entries);

        Ok(Self {
            port,
            ops: OpRegistry::with_capacity(entries as usize),
            capacity: entries as usize,
        })
    }

    /// Dequeue and dispatch one completion. `timeout_ms` 0 polls,
    /// `u32::MAX` waits. Returns `None` when nothing was dequeued, otherwise
    /// the number of buffer completions delivered (0 for an orphaned or
    /// stale completion, which still counts as a dequeue for drain loops).
    fn get_completion(&mut self, timeout_ms: u32) -> io::Result<Option<usize>> {
        let mut bytes_transferred = 0u32;
        let mut completion_key = 0usize;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

        let res = unsafe {
            GetQueuedCompletionStatus(
                self.port,
                &mut bytes_transferred,
                &mut completion_key,
                &mut overlapped,
                timeout_ms,
            )
        };

        if overlapped.is_null() {
            if res == 0 {
                let err = unsafe { GetLastError() };
                if err == WAIT_TIMEOUT {
                    return Ok(None);
                }
                return Err(io::Error::from_raw_os_error(err as i32));
            }
            return Ok(None);
        }

        let user_data = unsafe { (*(overlapped as *const OverlappedBlock)).user_data };
        let token = OpToken::from_user_data(user_data);
        let Some(entry) = self.ops.remove(token) else {
            // Stale block; generation check filtered it.
            return Ok(Some(0));
        };

        let outcome = if res != 0 {
            Ok(bytes_transferred as usize)
        } else {
            let err = unsafe { GetLastError() };
            match err {
                ERROR_HANDLE_EOF => Ok(0),
                ERROR_OPERATION_ABORTED => Err(TransferError::Cancelled),
                code => Err(TransferError::Os(code as i32)),
            }
        };

        trace!("completion user_data={} bytes={}", user_data, bytes_transferred);

        if entry.orphaned {
            return Ok(Some(0));
        }
        entry.buffer.complete(outcome);
        Ok(Some(1))
    }
}

impl Driver for IocpDriver {
    fn register_handle(&mut self, handle: SysHandle) -> io::Result<()> {
        let res = unsafe { CreateIoCompletionPort(handle as HANDLE, self.port, 0, 0) };
        if res.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn submit_transfer(&mut self, transfer: Transfer) -> Result<OpToken, SubmitError> {
        if self.ops.len() >= self.capacity {
            return Err(SubmitError::QueueFull);
        }

        let mut block = Box::new(OverlappedBlock {
            inner: unsafe { std::mem::zeroed() },
            user_data: 0,
        });
        block.inner.Anonymous.Anonymous.Offset = transfer.offset as u32;
        block.inner.Anonymous.Anonymous.OffsetHigh = (transfer.offset >> 32) as u32;

        let handle = transfer.handle as HANDLE;
        let kind = transfer.kind;
        let (ptr, len) = (transfer.ptr, transfer.len);

        let token = self.ops.insert(OpEntry {
            buffer: transfer.buffer,
            handle,
            overlapped: block,
            orphaned: false,
        });

        let Some(entry) = self.ops.get_mut(token) else {
            return Err(SubmitError::QueueFull);
        };
        entry.overlapped.user_data = token.into_user_data();
        let overlapped_ptr = &mut entry.overlapped.inner as *mut OVERLAPPED;

        let ret = unsafe {
            match kind {
                TransferKind::Read => {
                    ReadFile(handle, ptr as *mut _, len as u32, std::ptr::null_mut(), overlapped_ptr)
                }
                TransferKind::Write => WriteFile(
                    handle,
                    ptr as *const _,
                    len as u32,
                    std::ptr::null_mut(),
                    overlapped_ptr,
                ),
            }
        };

        if ret == 0 {
            let err = unsafe { GetLastError() };
            if err != ERROR_IO_PENDING {
                self.ops.remove(token);
                return Err(SubmitError::Failed(io::Error::from_raw_os_error(err as i32)));
            }
        }

        trace!(
            "submitted {:?} len={} offset={} user_data={}",
            kind,
            len,
            transfer.offset,
            token.into_user_data()
        );
        Ok(token)
    }

    fn cancel(&mut self, token: OpToken) -> bool {
        let Some(entry) = self.ops.get_mut(token) else {
            return true;
        };

        let overlapped_ptr = &entry.overlapped.inner as *const OVERLAPPED as *mut OVERLAPPED;
        let res = unsafe { CancelIoEx(entry.handle, overlapped_ptr) };
        if res == 0 {
            // The operation may already be completing; the port delivers the
            // final result either way.
            warn!("CancelIoEx failed: {}", io::Error::last_os_error());
        }
        true
    }

    fn orphan(&mut self, token: OpToken) {
        if let Some(entry) = self.ops.get_mut(token) {
            entry.orphaned = true;
        }
    }

    fn submit(&mut self) -> io::Result<()> {
        // Operations reach the kernel directly at submit_transfer time.
        Ok(())
    }

    fn wait(&mut self) -> io::Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let _ = self.get_completion(u32::MAX)?;
        Ok(())
    }

    fn process_completions(&mut self) -> usize {
        let mut delivered = 0;
        // An orphaned or stale completion dequeues as Some(0); keep draining
        // past those until the port is actually empty.
        while let Ok(Some(n)) = self.get_completion(0) {
            delivered += n;
        }
        delivered
    }

    fn has_inflight(&self) -> bool {
        !self.ops.is_empty()
    }
}

impl Drop for IocpDriver {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}
