//! Single-threaded cooperative executor.
//!
//! `block_on` alternates between polling the root future and pumping the
//! platform driver. Everything runs on the calling thread; completion
//! dispatch happens inline between polls, never concurrently with user code.

use crate::config::Config;
use crate::io::driver::{Driver, PlatformDriver};
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use tracing::trace;

struct LoopWaker {
    woken: AtomicBool,
}

impl Wake for LoopWaker {
    fn wake(self: Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }
}

pub struct EventLoop {
    driver: Rc<RefCell<PlatformDriver>>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> io::Result<EventLoop> {
        let driver = PlatformDriver::new(&config)?;
        Ok(EventLoop {
            driver: Rc::new(RefCell::new(driver)),
        })
    }

    pub(crate) fn driver(&self) -> Rc<RefCell<PlatformDriver>> {
        self.driver.clone()
    }

    /// Run `future` to completion, driving I/O in between polls.
    ///
    /// When the future is pending and nothing woke it synchronously, the
    /// loop parks in the driver until a completion arrives. A pending future
    /// with no in-flight operation and no pending wake would never progress,
    /// so that case panics instead of hanging.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = pin!(future);

        let loop_waker = Arc::new(LoopWaker {
            woken: AtomicBool::new(false),
        });
        let waker = Waker::from(loop_waker.clone());
        let mut cx = Context::from_waker(&waker);

        loop {
            loop_waker.woken.store(false, Ordering::Release);
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }

            let mut driver = self.driver.borrow_mut();
            if let Err(e) = driver.submit() {
                panic!("driver submit failed: {e}");
            }

            if loop_waker.woken.load(Ordering::Acquire) {
                // Woken during the poll (completion dispatched inline or an
                // immediately-ready sub-future); drain without blocking.
                driver.process_completions();
                continue;
            }

            if !driver.has_inflight() {
                panic!("future is pending but no operation is in flight");
            }

            trace!("parking in driver");
            if let Err(e) = driver.wait() {
                panic!("driver wait failed: {e}");
            }
        }
    }
}
