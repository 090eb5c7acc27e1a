//! Shared device lifecycle state and the waiter notification primitive.
//!
//! A device moves `Disabled -> Opening -> Ready -> Closing -> Disabled`,
//! driven only by `open()`/`close()`. Every transition fires an entry event;
//! any number of waiters can suspend until an event of interest fires and are
//! resumed in FIFO registration order within one notification pass.

use crate::buffer::BufferShared;
use crate::io::driver::PlatformDriver;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Handle closed; all buffers are inert.
    Disabled,
    /// Transient: `open()` in progress.
    Opening,
    /// Handle valid; buffers may start transfers.
    Ready,
    /// Transient: handle being torn down.
    Closing,
}

bitflags::bitflags! {
    /// State-entry events a waiter can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Events: u8 {
        const ENTER_DISABLED = 1 << 0;
        const ENTER_OPENING = 1 << 1;
        const ENTER_READY = 1 << 2;
        const ENTER_CLOSING = 1 << 3;
    }
}

impl DeviceState {
    pub(crate) fn entry_event(self) -> Events {
        match self {
            DeviceState::Disabled => Events::ENTER_DISABLED,
            DeviceState::Opening => Events::ENTER_OPENING,
            DeviceState::Ready => Events::ENTER_READY,
            DeviceState::Closing => Events::ENTER_CLOSING,
        }
    }
}

/// Slot handle held by a suspended future across polls. Only valid for the
/// epoch it was minted in; a recycled slot vec invalidates every key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaiterKey {
    pub(crate) index: usize,
    pub(crate) epoch: u32,
}

/// FIFO list of suspended waiters, each with an event-interest mask.
///
/// Slots are push-only within an epoch, so a key always refers to its own
/// waiter's slot and a future polled twice updates its waker in place
/// instead of queueing a duplicate. Recycling the vec bumps the epoch, which
/// invalidates outstanding keys and stops a stale key from clobbering a slot
/// claimed by a different waiter. A notification pass wakes every matching
/// waiter in registration order; ordering across separate passes is not
/// guaranteed.
#[derive(Default)]
pub(crate) struct StateWaiters {
    slots: RefCell<Vec<Option<(Events, Waker)>>>,
    epoch: Cell<u32>,
}

impl StateWaiters {
    /// Register interest in `mask`. `key` is the caller's slot handle across
    /// polls; it is reassigned when the slot was consumed by a notification
    /// or invalidated by an epoch change.
    pub(crate) fn register(&self, key: &mut Option<WaiterKey>, mask: Events, waker: &Waker) {
        let mut slots = self.slots.borrow_mut();
        if let Some(k) = *key {
            if k.epoch == self.epoch.get() {
                if let Some(Some((m, w))) = slots.get_mut(k.index) {
                    *m = mask;
                    if !w.will_wake(waker) {
                        *w = waker.clone();
                    }
                    return;
                }
            }
        }
        slots.push(Some((mask, waker.clone())));
        *key = Some(WaiterKey {
            index: slots.len() - 1,
            epoch: self.epoch.get(),
        });
    }

    /// Wake all waiters whose mask intersects `events`, in FIFO order.
    pub(crate) fn notify(&self, events: Events) {
        let mut slots = self.slots.borrow_mut();
        for slot in slots.iter_mut() {
            let fire = matches!(slot, Some((mask, _)) if mask.intersects(events));
            if fire {
                if let Some((_, waker)) = slot.take() {
                    waker.wake();
                }
            }
        }
        if slots.iter().all(Option::is_none) {
            slots.clear();
            self.epoch.set(self.epoch.get().wrapping_add(1));
        }
    }
}

/// State shared between a `File` device and every buffer registered into it.
pub(crate) struct DeviceShared {
    pub(crate) driver: Rc<RefCell<PlatformDriver>>,
    pub(crate) handle: Cell<Option<crate::io::SysHandle>>,
    pub(crate) state: Cell<DeviceState>,
    /// Auto-incrementing file cursor consumed by `HeaderType::None` buffers.
    /// Read and advanced synchronously inside `start()`, never at completion.
    pub(crate) cursor: Cell<u64>,
    /// Every buffer ever registered, in registration order.
    pub(crate) buffers: RefCell<Vec<Rc<BufferShared>>>,
    pub(crate) waiters: StateWaiters,
    pub(crate) last_error: Cell<Option<i32>>,
}

impl DeviceShared {
    pub(crate) fn new(driver: Rc<RefCell<PlatformDriver>>) -> Rc<Self> {
        Rc::new(Self {
            driver,
            handle: Cell::new(None),
            state: Cell::new(DeviceState::Disabled),
            cursor: Cell::new(0),
            buffers: RefCell::new(Vec::new()),
            waiters: StateWaiters::default(),
            last_error: Cell::new(None),
        })
    }

    pub(crate) fn set_system_error(&self, code: i32) {
        self.last_error.set(Some(code));
    }
}

/// Future resolving once the device enters (or already is in) `target`.
pub struct UntilState {
    pub(crate) dev: Rc<DeviceShared>,
    pub(crate) target: DeviceState,
    pub(crate) key: Option<WaiterKey>,
}

impl Future for UntilState {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.dev.state.get() == this.target {
            return Poll::Ready(());
        }
        this.dev
            .waiters
            .register(&mut this.key, this.target.entry_event(), cx.waker());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::Wake;

    struct OrderWaker {
        id: usize,
        order: Arc<Mutex<Vec<usize>>>,
        wakes: AtomicUsize,
    }

    impl Wake for OrderWaker {
        fn wake(self: Arc<Self>) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.id);
        }
    }

    fn waker(id: usize, order: &Arc<Mutex<Vec<usize>>>) -> (Arc<OrderWaker>, Waker) {
        let w = Arc::new(OrderWaker {
            id,
            order: order.clone(),
            wakes: AtomicUsize::new(0),
        });
        (w.clone(), Waker::from(w))
    }

    #[test]
    fn notify_wakes_in_fifo_order() {
        let waiters = StateWaiters::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (_, w0) = waker(0, &order);
        let (_, w1) = waker(1, &order);
        let (_, w2) = waker(2, &order);

        let mut k0 = None;
        let mut k1 = None;
        let mut k2 = None;
        waiters.register(&mut k0, Events::ENTER_READY, &w0);
        waiters.register(&mut k1, Events::ENTER_DISABLED, &w1);
        waiters.register(&mut k2, Events::ENTER_READY, &w2);

        waiters.notify(Events::ENTER_OPENING | Events::ENTER_READY);
        assert_eq!(*order.lock().unwrap(), vec![0, 2]);
    }

    #[test]
    fn notify_consumes_waiters() {
        let waiters = StateWaiters::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (state, w) = waker(7, &order);

        let mut key = None;
        waiters.register(&mut key, Events::ENTER_DISABLED, &w);
        waiters.notify(Events::ENTER_DISABLED);
        waiters.notify(Events::ENTER_DISABLED);
        assert_eq!(state.wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_keys_after_recycle_do_not_alias() {
        let waiters = StateWaiters::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, wa) = waker(0, &order);
        let (b, wb) = waker(1, &order);

        let mut ka = None;
        let mut kb = None;
        waiters.register(&mut ka, Events::ENTER_READY, &wa);
        waiters.register(&mut kb, Events::ENTER_READY, &wb);
        waiters.notify(Events::ENTER_READY);
        assert_eq!(a.wakes.load(Ordering::SeqCst), 1);
        assert_eq!(b.wakes.load(Ordering::SeqCst), 1);

        // The slot vec was recycled above. Re-register in reverse order with
        // the old keys still in hand; neither registration may overwrite the
        // other's slot.
        waiters.register(&mut kb, Events::ENTER_READY, &wb);
        waiters.register(&mut ka, Events::ENTER_READY, &wa);
        waiters.notify(Events::ENTER_READY);

        assert_eq!(a.wakes.load(Ordering::SeqCst), 2);
        assert_eq!(b.wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reregister_does_not_duplicate() {
        let waiters = StateWaiters::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (state, w) = waker(3, &order);

        let mut key = None;
        waiters.register(&mut key, Events::ENTER_READY, &w);
        waiters.register(&mut key, Events::ENTER_READY, &w);
        waiters.register(&mut key, Events::ENTER_READY, &w);

        waiters.notify(Events::ENTER_READY);
        assert_eq!(state.wakes.load(Ordering::SeqCst), 1);
    }
}
