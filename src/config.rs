#[derive(Debug, Clone)]
pub struct UringConfig {
    /// Submission queue size. Also caps the number of in-flight operations.
    pub entries: u32,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self { entries: 256 }
    }
}

#[derive(Debug, Clone)]
pub struct IocpConfig {
    /// Initial capacity of the operation registry.
    pub entries: u32,
}

impl Default for IocpConfig {
    fn default() -> Self {
        Self { entries: 256 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub uring: UringConfig,
    pub iocp: IocpConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uring(self, uring: UringConfig) -> Self {
        Self { uring, ..self }
    }

    pub fn iocp(self, iocp: IocpConfig) -> Self {
        Self { iocp, ..self }
    }
}
