use std::io;
use thiserror::Error;

/// Final outcome of a transfer that did not succeed.
///
/// Stored in the buffer's result slot so callers can tell backoff-and-retry
/// conditions (`QueueFull`) apart from real I/O faults (`Os`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The native submission queue had no free slot. The operation was never
    /// started; retry after the next pump iteration.
    #[error("submission queue full")]
    QueueFull,

    /// The operation was cancelled before it transferred any data.
    #[error("operation cancelled")]
    Cancelled,

    /// The device was closed while the operation was in flight.
    #[error("device closed")]
    DeviceClosed,

    /// A platform error code from the native read/write path.
    #[error("os error {0}")]
    Os(i32),
}

impl From<TransferError> for io::Error {
    fn from(e: TransferError) -> io::Error {
        match e {
            TransferError::QueueFull => io::Error::new(io::ErrorKind::WouldBlock, e),
            TransferError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, e),
            TransferError::DeviceClosed => io::Error::new(io::ErrorKind::NotConnected, e),
            TransferError::Os(code) => io::Error::from_raw_os_error(code),
        }
    }
}

/// Failure reported by `Driver::submit_transfer` before anything reached the
/// kernel. No completion will ever be delivered for these.
#[derive(Debug, Error)]
pub(crate) enum SubmitError {
    #[error("submission queue full")]
    QueueFull,

    /// The native call failed synchronously (completion-port adapters only).
    /// The device layer treats this as a synchronous zero-byte completion.
    #[error(transparent)]
    Failed(io::Error),
}
