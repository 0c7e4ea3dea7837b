//! Loader configuration.

use crate::loader::seed_key::SeedKeyResolver;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration of an [`XcpLoader`](crate::loader::XcpLoader).
///
/// Every command class has its own timeout:
///
/// | field | command class                 | default  |
/// |-------|-------------------------------|----------|
/// | `t1`  | generic commands              | 1000 ms  |
/// | `t3`  | PROGRAM_START                 | 2000 ms  |
/// | `t4`  | PROGRAM_CLEAR (erase)         | 10000 ms |
/// | `t5`  | PROGRAM / PROGRAM_MAX         | 1000 ms  |
/// | `t6`  | CONNECT                       | 50 ms    |
/// | `t7`  | total wait while target busy  | 2000 ms  |
#[derive(Clone)]
pub struct XcpLoaderSettings {
    /// Generic command timeout.
    pub t1: Duration,
    /// PROGRAM_START timeout.
    pub t3: Duration,
    /// PROGRAM_CLEAR timeout.
    pub t4: Duration,
    /// PROGRAM and PROGRAM_MAX timeout.
    pub t5: Duration,
    /// CONNECT timeout.
    pub t6: Duration,
    /// Busy-wait budget for a command answered with ERR_CMD_BUSY.
    pub t7: Duration,
    /// Mode byte sent with CONNECT.
    pub connect_mode: u8,
    /// Largest range erased by a single PROGRAM_CLEAR.
    pub max_erase_size: u32,
    /// Resolver used when the PGM resource is protected.
    pub seed_key: Option<Arc<dyn SeedKeyResolver>>,
}

impl Default for XcpLoaderSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(1000),
            t3: Duration::from_millis(2000),
            t4: Duration::from_millis(10000),
            t5: Duration::from_millis(1000),
            t6: Duration::from_millis(50),
            t7: Duration::from_millis(2000),
            connect_mode: 0,
            max_erase_size: u32::MAX,
            seed_key: None,
        }
    }
}

impl XcpLoaderSettings {
    /// Use `resolver` to unlock a protected target.
    #[must_use]
    pub fn with_seed_key(mut self, resolver: Arc<dyn SeedKeyResolver>) -> Self {
        self.seed_key = Some(resolver);
        self
    }

    /// Set the CONNECT mode byte.
    #[must_use]
    pub fn with_connect_mode(mut self, mode: u8) -> Self {
        self.connect_mode = mode;
        self
    }

    /// Limit the range of a single erase request.
    #[must_use]
    pub fn with_max_erase_size(mut self, size: u32) -> Self {
        self.max_erase_size = size.max(1);
        self
    }
}

impl fmt::Debug for XcpLoaderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XcpLoaderSettings")
            .field("t1", &self.t1)
            .field("t3", &self.t3)
            .field("t4", &self.t4)
            .field("t5", &self.t5)
            .field("t6", &self.t6)
            .field("t7", &self.t7)
            .field("connect_mode", &self.connect_mode)
            .field("max_erase_size", &self.max_erase_size)
            .field("seed_key", &self.seed_key.is_some())
            .finish()
    }
}
