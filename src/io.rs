pub(crate) mod driver;

/// Platform-agnostic raw handle: fd on Unix, HANDLE on Windows.
pub(crate) type SysHandle = usize;
