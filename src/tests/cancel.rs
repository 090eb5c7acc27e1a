//! Cancellation and queue-pressure tests, built on a fifo so reads stay in
//! flight until the test decides otherwise.

use crate::{
    BufferState, Config, EventLoop, File, HeaderType, Mode, Op, TransferBuffer, TransferError,
    UringConfig,
};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn make_fifo(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) }, 0);
    path
}

fn open_write_end(path: &Path) -> libc::c_int {
    let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
    assert!(fd >= 0, "fifo has no reader");
    fd
}

#[test]
fn cancel_pending_read() {
    let dir = tempdir().unwrap();
    let fifo = make_fifo(dir.path(), "cancel.fifo");

    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    let buffer = TransferBuffer::new(&file, 16, HeaderType::None);
    assert!(file.open(&fifo, Mode::READ));
    // Keep a silent writer attached so the read stays in flight instead of
    // hitting end-of-file.
    let writer = open_write_end(&fifo);

    assert!(buffer.start(16, Op::READ));
    assert_eq!(buffer.state(), BufferState::Busy);

    assert!(buffer.cancel());
    // Repeated requests while the first is pending are absorbed.
    assert!(buffer.cancel());

    event_loop.block_on(buffer.until_not_busy());
    assert_eq!(buffer.state(), BufferState::Ready);
    assert_eq!(buffer.error(), Some(TransferError::Cancelled));
    assert_eq!(buffer.transferred(), 0);

    unsafe { libc::close(writer) };
}

#[test]
fn cancel_idle_buffer_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idle.bin");

    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    let buffer = TransferBuffer::new(&file, 8, HeaderType::None);

    assert!(!buffer.cancel());
    assert!(file.open(&path, Mode::NEW));
    assert!(!buffer.cancel());
}

#[test]
fn cancelled_buffer_is_reusable() {
    let dir = tempdir().unwrap();
    let fifo = make_fifo(dir.path(), "reuse.fifo");

    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    let buffer = TransferBuffer::new(&file, 16, HeaderType::None);
    assert!(file.open(&fifo, Mode::READ));
    let writer = open_write_end(&fifo);

    assert!(buffer.start(16, Op::READ));
    assert!(buffer.cancel());
    event_loop.block_on(buffer.until_not_busy());
    assert_eq!(buffer.error(), Some(TransferError::Cancelled));

    // Same buffer goes straight back into flight, and this time data flows.
    assert!(buffer.start(16, Op::READ));
    assert_eq!(unsafe { libc::write(writer, b"ping".as_ptr().cast(), 4) }, 4);

    event_loop.block_on(buffer.until_not_busy());
    assert_eq!(buffer.error(), None);
    assert_eq!(buffer.transferred_bytes(), b"ping");

    unsafe { libc::close(writer) };
}

#[test]
fn full_queue_reports_retryable_error() {
    let dir = tempdir().unwrap();
    let fifo = make_fifo(dir.path(), "full.fifo");

    let config = Config::new().uring(UringConfig { entries: 4 });
    let event_loop = EventLoop::with_config(config).unwrap();
    let file = File::new(&event_loop);
    let buffers: Vec<_> = (0..5)
        .map(|_| TransferBuffer::new(&file, 16, HeaderType::None))
        .collect();
    assert!(file.open(&fifo, Mode::READ));
    let writer = open_write_end(&fifo);

    for buffer in &buffers[..4] {
        assert!(buffer.start(16, Op::READ));
    }

    // Fifth submission exceeds the in-flight cap: rejected without side
    // effects, ready for retry.
    let overflow = &buffers[4];
    assert!(!overflow.start(16, Op::READ));
    assert_eq!(overflow.state(), BufferState::Ready);
    assert_eq!(overflow.error(), Some(TransferError::QueueFull));

    // Drain the four pending reads so teardown is orderly.
    let payload = [b'x'; 64];
    assert!(unsafe { libc::write(writer, payload.as_ptr().cast(), 64) } > 0);
    for buffer in &buffers[..4] {
        event_loop.block_on(buffer.until_not_busy());
        assert!(buffer.error().is_none());
        assert!(buffer.transferred() > 0);
    }

    // With capacity free again the retry goes through.
    assert!(unsafe { libc::write(writer, payload.as_ptr().cast(), 16) } > 0);
    assert!(overflow.start(16, Op::READ));
    event_loop.block_on(overflow.until_not_busy());
    assert!(overflow.transferred() > 0);

    unsafe { libc::close(writer) };
}

#[test]
fn close_with_pending_read_does_not_block() {
    let dir = tempdir().unwrap();
    let fifo = make_fifo(dir.path(), "close.fifo");

    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    let buffer = TransferBuffer::new(&file, 16, HeaderType::None);
    assert!(file.open(&fifo, Mode::READ));
    let writer = open_write_end(&fifo);

    assert!(buffer.start(16, Op::READ));
    file.close();

    assert_eq!(buffer.state(), BufferState::Disabled);
    assert_eq!(buffer.error(), Some(TransferError::DeviceClosed));

    unsafe { libc::close(writer) };
}
