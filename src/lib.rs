//! Portable asynchronous file I/O built on buffer objects.
//!
//! A [`File`] is a device with a lifecycle state machine; data moves through
//! [`TransferBuffer`]s registered into it. Buffers either stream through the
//! device's shared sequential cursor or carry an explicit file offset in a
//! small header, and every transfer completes through the platform's native
//! completion mechanism (io_uring on Linux, I/O completion ports on
//! Windows).
//!
//! Everything is single-threaded and cooperative: create an [`EventLoop`],
//! build files and buffers against it, and drive the whole thing with
//! [`EventLoop::block_on`].
//!
//! ```no_run
//! use bufdev::{EventLoop, File, HeaderType, Mode, Op, TransferBuffer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let file = File::new(&event_loop);
//! let buffer = TransferBuffer::new(&file, 4096, HeaderType::None);
//!
//! file.open("data.bin", Mode::NEW);
//! buffer.payload_mut(|p| p[..5].copy_from_slice(b"hello"));
//! buffer.start(5, Op::WRITE);
//!
//! event_loop.block_on(buffer.until_not_busy());
//! assert_eq!(buffer.transferred(), 5);
//! ```

mod buffer;
mod config;
mod device;
mod error;
mod event_loop;
mod file;
mod io;

pub use buffer::{BufferState, HeaderType, Op, TransferBuffer, UntilNotBusy};
pub use config::{Config, IocpConfig, UringConfig};
pub use device::{DeviceState, UntilState};
pub use error::TransferError;
pub use event_loop::EventLoop;
pub use file::{File, Mode};

#[cfg(test)]
mod tests {
    #[cfg(target_os = "linux")]
    mod cancel;
    mod cursor;
    mod device;
    mod file;
}
