//! Configuration for the gust receiver.
//!
//! Options form an immutable bag that is threaded into a session when it
//! starts; workers receive the fields they need by value, so changing an
//! option mid-session has no effect. Options are stored in TOML format.

use crate::error::TransferError;
use crate::protocol::MAX_HEADER;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default per-worker receive buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
/// Default listen backlog; one connection is served at a time per port.
pub const DEFAULT_BACKLOG: i32 = 1;
/// Default total number of bind/listen attempts per worker.
pub const DEFAULT_MAX_RETRIES: u32 = 20;
/// Default sleep between failed listen attempts, in milliseconds.
pub const DEFAULT_SLEEP_MILLIS: u64 = 50;
/// Default stall watchdog sampling interval, in milliseconds.
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL_MILLIS: i64 = 500;
/// Default number of zero-progress samples tolerated before teardown.
pub const DEFAULT_FAILED_TIMEOUT_CHECKS: u64 = 200;

/// Receiver tuning options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverOptions {
    /// Receive buffer size per worker, in bytes. Values smaller than the
    /// protocol header bound are rounded up to the next 2 KiB multiple at
    /// session start.
    pub buffer_size: usize,
    /// Listen backlog for each per-port socket.
    pub backlog: i32,
    /// Total bind/listen attempts before a worker gives up.
    pub max_retries: u32,
    /// Sleep between failed listen attempts, in milliseconds.
    pub sleep_millis: u64,
    /// Drain incoming blocks without opening or writing destination files.
    pub skip_writes: bool,
    /// Stall watchdog sampling interval in milliseconds; negative disables
    /// the watchdog.
    pub timeout_check_interval_millis: i64,
    /// Zero-progress samples tolerated before worker sockets are shut down.
    pub failed_timeout_checks: u64,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            max_retries: DEFAULT_MAX_RETRIES,
            sleep_millis: DEFAULT_SLEEP_MILLIS,
            skip_writes: false,
            timeout_check_interval_millis: DEFAULT_TIMEOUT_CHECK_INTERVAL_MILLIS,
            failed_timeout_checks: DEFAULT_FAILED_TIMEOUT_CHECKS,
        }
    }
}

impl ReceiverOptions {
    /// Loads options from a TOML file, or writes and returns the defaults
    /// if the file doesn't exist.
    pub fn load_or_create(path: &Path) -> Result<Self, TransferError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let options = Self::default();
            options.save(path)?;
            Ok(options)
        }
    }

    /// Saves the options to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// The buffer size a session will actually use: a configured value of
    /// at least [`MAX_HEADER`] is taken as-is, anything smaller is rounded
    /// up to the smallest multiple of 2048 that fits a full header.
    pub fn effective_buffer_size(&self) -> usize {
        if self.buffer_size >= MAX_HEADER {
            self.buffer_size
        } else {
            2 * 1024 * ((MAX_HEADER - 1) / (2 * 1024) + 1)
        }
    }
}
