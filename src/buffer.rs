//! The transfer unit: owned payload, optional offset header, state, result.
//!
//! A buffer is registered into exactly one device for its whole lifetime.
//! `start()` submits it to the platform adapter and the adapter's completion
//! dispatch brings it back out of `Busy` exactly once per started operation.

use crate::device::{DeviceShared, DeviceState, WaiterKey};
use crate::error::{SubmitError, TransferError};
use crate::file::File;
use crate::io::driver::{Driver, Transfer, TransferKind};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use tracing::trace;

/// Lifecycle state of a single buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Device not ready; the buffer is inert.
    Disabled,
    /// Idle; may be started.
    Ready,
    /// Operation submitted, awaiting completion.
    Busy,
}

bitflags::bitflags! {
    /// Operation kind, plus the marker recording a requested cancellation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Op: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Cancellation already requested for the in-flight operation.
        /// Internal marker; never passed to `start()`.
        const CANCEL = 1 << 2;
    }
}

/// How a buffer addresses the file.
///
/// `None` consumes and advances the device's shared cursor (sequential
/// access); the offset variants carry an explicit file offset in the
/// buffer's own header field (random access) and never touch the cursor.
/// Chosen at construction, immutable for the buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    None,
    Offset4,
    Offset8,
}

/// FIFO list of wakers waiting for this buffer to leave `Busy`.
///
/// Same slot-plus-epoch scheme as the device's `StateWaiters`: slots are
/// push-only within an epoch and draining bumps the epoch, so a stale key
/// held by a re-polling future can never land on another waiter's slot.
#[derive(Default)]
pub(crate) struct WakeList {
    slots: RefCell<Vec<Option<Waker>>>,
    epoch: Cell<u32>,
}

impl WakeList {
    fn register(&self, key: &mut Option<WaiterKey>, waker: &Waker) {
        let mut slots = self.slots.borrow_mut();
        if let Some(k) = *key {
            if k.epoch == self.epoch.get() {
                if let Some(Some(w)) = slots.get_mut(k.index) {
                    if !w.will_wake(waker) {
                        *w = waker.clone();
                    }
                    return;
                }
            }
        }
        slots.push(Some(waker.clone()));
        *key = Some(WaiterKey {
            index: slots.len() - 1,
            epoch: self.epoch.get(),
        });
    }

    fn wake_all(&self) {
        let mut slots = self.slots.borrow_mut();
        for slot in slots.iter_mut() {
            if let Some(waker) = slot.take() {
                waker.wake();
            }
        }
        slots.clear();
        self.epoch.set(self.epoch.get().wrapping_add(1));
    }
}

pub(crate) struct BufferShared {
    device: Weak<DeviceShared>,
    /// Payload memory. Heap-allocated and never reallocated, so the address
    /// handed to the kernel stays valid while the operation is in flight.
    payload: UnsafeCell<Box<[u8]>>,
    header_type: HeaderType,
    header: Cell<u64>,
    state: Cell<BufferState>,
    op: Cell<Op>,
    token: Cell<Option<crate::io::driver::OpToken>>,
    transferred: Cell<usize>,
    error: Cell<Option<TransferError>>,
    waiters: WakeList,
}

impl BufferShared {
    pub(crate) fn state(&self) -> BufferState {
        self.state.get()
    }

    pub(crate) fn token(&self) -> Option<crate::io::driver::OpToken> {
        self.token.get()
    }

    fn capacity(&self) -> usize {
        unsafe { (&*self.payload.get()).len() }
    }

    fn payload_ptr(&self) -> *mut u8 {
        unsafe { (&mut *self.payload.get()).as_mut_ptr() }
    }

    /// Overwrite the result slot. Only called on entry into
    /// `Ready`/`Disabled` or by a synchronously rejected `start()`.
    fn record(&self, outcome: Result<usize, TransferError>) {
        match outcome {
            Ok(n) => {
                self.transferred.set(n);
                self.error.set(None);
            }
            Err(e) => {
                self.transferred.set(0);
                self.error.set(Some(e));
            }
        }
    }

    /// Completion entry point, invoked by the platform adapter exactly once
    /// per started operation, on the event-loop thread.
    pub(crate) fn complete(&self, outcome: Result<usize, TransferError>) {
        debug_assert_eq!(self.state.get(), BufferState::Busy);
        self.token.set(None);
        self.record(outcome);

        let device_ready = self
            .device
            .upgrade()
            .is_some_and(|dev| dev.state.get() == DeviceState::Ready);
        self.state.set(if device_ready {
            BufferState::Ready
        } else {
            BufferState::Disabled
        });
        self.op.set(self.op.get() - Op::CANCEL);
        self.waiters.wake_all();
    }

    /// Device entered `Ready`: buffers come up idle with a clean result.
    pub(crate) fn enable(&self) {
        debug_assert_ne!(self.state.get(), BufferState::Busy);
        self.record(Ok(0));
        self.state.set(BufferState::Ready);
        self.waiters.wake_all();
    }

    /// Device left `Ready`. For an in-flight buffer the caller has already
    /// cancelled and orphaned the native operation; the buffer is forcibly
    /// invalidated here and its late completion is dropped by the adapter.
    pub(crate) fn disable(&self, error: Option<TransferError>) {
        if self.state.get() == BufferState::Busy {
            self.token.set(None);
            self.record(Err(error.unwrap_or(TransferError::DeviceClosed)));
            self.op.set(self.op.get() - Op::CANCEL);
        }
        self.state.set(BufferState::Disabled);
        self.waiters.wake_all();
    }
}

/// A transfer buffer registered into a [`File`]. Cheap to clone; clones are
/// handles to the same underlying buffer.
#[derive(Clone)]
pub struct TransferBuffer {
    pub(crate) shared: Rc<BufferShared>,
}

impl TransferBuffer {
    /// Create a buffer with `capacity` bytes of payload and register it into
    /// `file` for the rest of its lifetime.
    pub fn new(file: &File, capacity: usize, header_type: HeaderType) -> TransferBuffer {
        let initial = if file.state() == DeviceState::Ready {
            BufferState::Ready
        } else {
            BufferState::Disabled
        };
        let shared = Rc::new(BufferShared {
            device: Rc::downgrade(&file.dev),
            payload: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            header_type,
            header: Cell::new(0),
            state: Cell::new(initial),
            op: Cell::new(Op::empty()),
            token: Cell::new(None),
            transferred: Cell::new(0),
            error: Cell::new(None),
            waiters: WakeList::default(),
        });
        file.dev.buffers.borrow_mut().push(shared.clone());
        TransferBuffer { shared }
    }

    pub fn state(&self) -> BufferState {
        self.shared.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BufferState::Ready
    }

    pub fn is_busy(&self) -> bool {
        self.state() == BufferState::Busy
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn header_type(&self) -> HeaderType {
        self.shared.header_type
    }

    /// Begin an asynchronous transfer of `size` bytes.
    ///
    /// Preconditions: buffer and device both `Ready`, `op` contains `READ`
    /// or `WRITE`, `size` nonzero and within capacity. A precondition
    /// failure is a no-op, not a fault: the result becomes a zero-byte
    /// success and `false` is returned. A full submission queue records
    /// [`TransferError::QueueFull`] instead and the buffer stays `Ready`.
    pub fn start(&self, size: usize, op: Op) -> bool {
        let s = &self.shared;

        let Some(dev) = s.device.upgrade() else {
            s.record(Ok(0));
            return false;
        };

        if s.state.get() != BufferState::Ready
            || dev.state.get() != DeviceState::Ready
            || !op.intersects(Op::READ_WRITE)
            || size == 0
            || size > s.capacity()
        {
            debug_assert_ne!(s.state.get(), BufferState::Busy);
            s.record(Ok(0));
            return false;
        }

        let Some(handle) = dev.handle.get() else {
            s.record(Ok(0));
            return false;
        };

        // Sequential buffers consume the shared cursor; header buffers carry
        // their own offset and leave the cursor alone.
        let offset = match s.header_type {
            HeaderType::None => dev.cursor.get(),
            HeaderType::Offset4 | HeaderType::Offset8 => s.header.get(),
        };
        let kind = if op.contains(Op::WRITE) {
            TransferKind::Write
        } else {
            TransferKind::Read
        };

        let submitted = dev.driver.borrow_mut().submit_transfer(Transfer {
            kind,
            handle,
            offset,
            ptr: s.payload_ptr(),
            len: size,
            buffer: s.clone(),
        });

        match submitted {
            Ok(token) => {
                // Advance the cursor at submission time so back-to-back
                // sequential starts never observe the same value.
                if s.header_type == HeaderType::None {
                    dev.cursor.set(offset + size as u64);
                }
                s.op.set(op & Op::READ_WRITE);
                s.token.set(Some(token));
                s.state.set(BufferState::Busy);
                true
            }
            Err(SubmitError::QueueFull) => {
                s.record(Err(TransferError::QueueFull));
                false
            }
            Err(SubmitError::Failed(e)) => {
                // Immediate failure that is not "pending" counts as a
                // synchronous zero-byte completion.
                dev.set_system_error(e.raw_os_error().unwrap_or(0));
                s.record(Ok(0));
                false
            }
        }
    }

    /// Request cancellation of the in-flight operation.
    ///
    /// Idempotent: a second call while cancellation is pending is a no-op
    /// returning `true`. The final result still arrives through the normal
    /// completion path — either the original data or
    /// [`TransferError::Cancelled`]. Returns `false` when nothing is in
    /// flight, or when the cancellation could not be queued (retry then).
    pub fn cancel(&self) -> bool {
        let s = &self.shared;
        if s.state.get() != BufferState::Busy {
            return false;
        }
        if s.op.get().contains(Op::CANCEL) {
            return true;
        }
        let (Some(dev), Some(token)) = (s.device.upgrade(), s.token.get()) else {
            return false;
        };

        if dev.driver.borrow_mut().cancel(token) {
            s.op.set(s.op.get() | Op::CANCEL);
            trace!("cancellation requested");
            true
        } else {
            // Ring full; the buffer stays busy and the caller retries.
            false
        }
    }

    /// Set the explicit 32-bit file offset for the next `start()`.
    /// Valid only for `HeaderType::Offset4` buffers that are not busy.
    pub fn set_header_u32(&self, offset: u32) -> bool {
        if self.shared.header_type != HeaderType::Offset4 || self.is_busy() {
            return false;
        }
        self.shared.header.set(u64::from(offset));
        true
    }

    /// Set the explicit 64-bit file offset for the next `start()`.
    /// Valid only for `HeaderType::Offset8` buffers that are not busy.
    pub fn set_header_u64(&self, offset: u64) -> bool {
        if self.shared.header_type != HeaderType::Offset8 || self.is_busy() {
            return false;
        }
        self.shared.header.set(offset);
        true
    }

    /// The explicit offset carried by this buffer, or `None` for sequential
    /// (`HeaderType::None`) buffers.
    pub fn header(&self) -> Option<u64> {
        match self.shared.header_type {
            HeaderType::None => None,
            _ => Some(self.shared.header.get()),
        }
    }

    /// Bytes moved by the last completed operation.
    pub fn transferred(&self) -> usize {
        self.shared.transferred.get()
    }

    /// Error from the last completed (or rejected) operation, if any.
    pub fn error(&self) -> Option<TransferError> {
        self.shared.error.get()
    }

    /// Mutable access to the payload. Refused while the operation is in
    /// flight — the kernel owns the memory during that window.
    pub fn payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        if self.is_busy() {
            return None;
        }
        // Not busy, single-threaded: no other reference to the payload.
        let slice = unsafe { &mut *self.shared.payload.get() };
        Some(f(slice))
    }

    /// Copy out the range covered by the last completed transfer.
    /// Empty while busy.
    pub fn transferred_bytes(&self) -> Vec<u8> {
        if self.is_busy() {
            return Vec::new();
        }
        let n = self.shared.transferred.get();
        let slice = unsafe { &*self.shared.payload.get() };
        slice[..n.min(slice.len())].to_vec()
    }

    /// Suspend until the buffer leaves `Busy`. Resolves immediately for an
    /// idle buffer. Wake order is FIFO within one completion.
    pub fn until_not_busy(&self) -> UntilNotBusy {
        UntilNotBusy {
            shared: self.shared.clone(),
            key: None,
        }
    }
}

/// Future resolving once the buffer is no longer `Busy`.
pub struct UntilNotBusy {
    shared: Rc<BufferShared>,
    key: Option<WaiterKey>,
}

impl Future for UntilNotBusy {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.shared.state.get() != BufferState::Busy {
            return Poll::Ready(());
        }
        this.shared.waiters.register(&mut this.key, cx.waker());
        Poll::Pending
    }
}
