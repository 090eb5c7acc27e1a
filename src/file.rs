//! Asynchronous file device.
//!
//! A `File` owns one native handle and any number of registered transfer
//! buffers. `open()`/`close()` drive the lifecycle state machine and fan the
//! resulting enable/disable out to every buffer; the actual data movement
//! happens through [`TransferBuffer::start`].
//!
//! [`TransferBuffer::start`]: crate::TransferBuffer::start

use crate::buffer::TransferBuffer;
use crate::device::{DeviceShared, DeviceState, Events, UntilState};
use crate::error::TransferError;
use crate::event_loop::EventLoop;
use crate::io::driver::Driver;
use std::io;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

bitflags::bitflags! {
    /// Open disposition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Create the file when it does not exist.
        const CREATE = 1 << 2;
        /// Truncate existing contents on open.
        const TRUNCATE = 1 << 3;
        /// Read-write on a fresh (created or emptied) file.
        const NEW = Self::READ_WRITE.bits() | Self::CREATE.bits() | Self::TRUNCATE.bits();
    }
}

pub struct File {
    pub(crate) dev: Rc<DeviceShared>,
}

impl File {
    /// Create a closed file device bound to `event_loop`'s driver.
    pub fn new(event_loop: &EventLoop) -> File {
        File {
            dev: DeviceShared::new(event_loop.driver()),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.dev.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DeviceState::Ready
    }

    /// Open `path` with `mode`.
    ///
    /// Only valid from `Disabled`; otherwise a no-op returning `false`. On
    /// success the device enters `Ready`, the cursor resets to zero and every
    /// registered buffer becomes `Ready` with a clean zero-byte result. On
    /// failure the device returns to `Disabled` with the OS error recorded
    /// in [`File::last_os_error`].
    pub fn open(&self, path: impl AsRef<Path>, mode: Mode) -> bool {
        if self.dev.state.get() != DeviceState::Disabled {
            return false;
        }
        self.dev.state.set(DeviceState::Opening);

        let handle = match sys::open(path.as_ref(), mode) {
            Ok(handle) => handle,
            Err(e) => {
                debug!("open failed: {}", e);
                self.dev.set_system_error(e.raw_os_error().unwrap_or(0));
                self.dev.state.set(DeviceState::Disabled);
                self.dev
                    .waiters
                    .notify(Events::ENTER_OPENING | Events::ENTER_DISABLED);
                return false;
            }
        };

        if let Err(e) = self.dev.driver.borrow_mut().register_handle(handle) {
            debug!("handle registration failed: {}", e);
            sys::close(handle);
            self.dev.set_system_error(e.raw_os_error().unwrap_or(0));
            self.dev.state.set(DeviceState::Disabled);
            self.dev
                .waiters
                .notify(Events::ENTER_OPENING | Events::ENTER_DISABLED);
            return false;
        }

        self.dev.handle.set(Some(handle));
        self.dev.cursor.set(0);
        for buffer in self.dev.buffers.borrow().iter() {
            buffer.enable();
        }
        self.dev.state.set(DeviceState::Ready);
        // Opening resolves within the call, so both entry events land in one
        // notification pass.
        self.dev
            .waiters
            .notify(Events::ENTER_OPENING | Events::ENTER_READY);
        true
    }

    /// Close the device.
    ///
    /// Idempotent; from `Disabled` nothing happens and no events fire.
    /// Buffers still in flight get a best-effort cancellation, are detached
    /// from their native operation and forced to `Disabled` with
    /// [`TransferError::DeviceClosed`]; the close itself never blocks.
    pub fn close(&self) {
        if self.dev.state.get() == DeviceState::Disabled {
            return;
        }
        self.dev.state.set(DeviceState::Closing);
        self.dev.waiters.notify(Events::ENTER_CLOSING);

        {
            let mut driver = self.dev.driver.borrow_mut();
            for buffer in self.dev.buffers.borrow().iter() {
                if let Some(token) = buffer.token() {
                    driver.cancel(token);
                    driver.orphan(token);
                }
                buffer.disable(Some(TransferError::DeviceClosed));
            }
        }

        if let Some(handle) = self.dev.handle.take() {
            sys::close(handle);
        }
        self.dev.state.set(DeviceState::Disabled);
        self.dev.waiters.notify(Events::ENTER_DISABLED);
    }

    /// Current size of the underlying file in bytes.
    pub fn size(&self) -> io::Result<u64> {
        let Some(handle) = self.dev.handle.get() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        };
        match sys::size(handle) {
            Ok(size) => Ok(size),
            Err(e) => {
                self.dev.set_system_error(e.raw_os_error().unwrap_or(0));
                Err(e)
            }
        }
    }

    /// Grow or shrink the underlying file to `size` bytes. On failure the
    /// OS error lands in [`File::last_os_error`].
    pub fn resize(&self, size: u64) -> bool {
        let Some(handle) = self.dev.handle.get() else {
            return false;
        };
        match sys::resize(handle, size) {
            Ok(()) => true,
            Err(e) => {
                self.dev.set_system_error(e.raw_os_error().unwrap_or(0));
                false
            }
        }
    }

    /// Reposition the sequential cursor. Buffers with an explicit offset
    /// header are unaffected. Only valid while `Ready`.
    pub fn seek(&self, position: u64) -> bool {
        if self.dev.state.get() != DeviceState::Ready {
            return false;
        }
        self.dev.cursor.set(position);
        true
    }

    /// Current sequential cursor position.
    pub fn position(&self) -> u64 {
        self.dev.cursor.get()
    }

    pub fn buffer_count(&self) -> usize {
        self.dev.buffers.borrow().len()
    }

    /// Handle to the `index`-th registered buffer, in registration order.
    pub fn buffer(&self, index: usize) -> Option<TransferBuffer> {
        self.dev
            .buffers
            .borrow()
            .get(index)
            .map(|shared| TransferBuffer {
                shared: shared.clone(),
            })
    }

    /// Suspend until the device enters (or already is in) `target`.
    pub fn until_state(&self, target: DeviceState) -> UntilState {
        UntilState {
            dev: self.dev.clone(),
            target,
            key: None,
        }
    }

    /// OS error code recorded by the last failed `open()` or synchronously
    /// failed submission.
    pub fn last_os_error(&self) -> Option<i32> {
        self.dev.last_error.get()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
mod sys {
    use super::Mode;
    use crate::io::SysHandle;
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    pub(super) fn open(path: &Path, mode: Mode) -> io::Result<SysHandle> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        let mut flags = if mode.contains(Mode::READ_WRITE) {
            libc::O_RDWR
        } else if mode.contains(Mode::WRITE) {
            libc::O_WRONLY
        } else {
            libc::O_RDONLY
        };
        flags |= libc::O_CLOEXEC | libc::O_NONBLOCK;
        if mode.contains(Mode::CREATE) {
            flags |= libc::O_CREAT;
        }
        if mode.contains(Mode::TRUNCATE) {
            flags |= libc::O_TRUNC;
        }

        let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o666 as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd as SysHandle)
    }

    pub(super) fn close(handle: SysHandle) {
        unsafe { libc::close(handle as libc::c_int) };
    }

    pub(super) fn size(handle: SysHandle) -> io::Result<u64> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let res = unsafe { libc::fstat(handle as libc::c_int, &mut stat) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stat.st_size as u64)
    }

    pub(super) fn resize(handle: SysHandle, size: u64) -> io::Result<()> {
        let res = unsafe { libc::ftruncate(handle as libc::c_int, size as libc::off_t) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use super::Mode;
    use crate::io::SysHandle;
    use std::io;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;

    use windows_sys::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, GetFileSizeEx, SetEndOfFile, SetFilePointerEx, CREATE_ALWAYS, FILE_BEGIN,
        FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS, OPEN_EXISTING,
        TRUNCATE_EXISTING,
    };

    pub(super) fn open(path: &Path, mode: Mode) -> io::Result<SysHandle> {
        let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
        wide.push(0);

        let mut access = 0u32;
        if mode.contains(Mode::READ) {
            access |= GENERIC_READ;
        }
        if mode.contains(Mode::WRITE) {
            access |= GENERIC_WRITE;
        }

        let disposition = if mode.contains(Mode::CREATE | Mode::TRUNCATE) {
            CREATE_ALWAYS
        } else if mode.contains(Mode::CREATE) {
            OPEN_ALWAYS
        } else if mode.contains(Mode::TRUNCATE) {
            TRUNCATE_EXISTING
        } else {
            OPEN_EXISTING
        };

        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                std::ptr::null(),
                disposition,
                FILE_FLAG_OVERLAPPED,
                std::ptr::null_mut(),
            )
        };
        if handle == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(handle as SysHandle)
    }

    pub(super) fn close(handle: SysHandle) {
        unsafe { CloseHandle(handle as HANDLE) };
    }

    pub(super) fn size(handle: SysHandle) -> io::Result<u64> {
        let mut size = 0i64;
        let res = unsafe { GetFileSizeEx(handle as HANDLE, &mut size) };
        if res == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(size as u64)
    }

    pub(super) fn resize(handle: SysHandle, size: u64) -> io::Result<()> {
        unsafe {
            if SetFilePointerEx(handle as HANDLE, size as i64, std::ptr::null_mut(), FILE_BEGIN)
                == 0
            {
                return Err(io::Error::last_os_error());
            }
            if SetEndOfFile(handle as HANDLE) == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
