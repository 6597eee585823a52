//! Per-worker transfer statistics and the end-of-session report.

use crate::error::ErrorCode;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Counters owned by a single worker thread.
///
/// Only the owning worker mutates these during a session. The stall
/// watchdog concurrently samples [`TransferStats::total_bytes`], so the
/// counters are relaxed atomics; a stale read within one sample is fine.
#[derive(Debug, Default)]
pub struct TransferStats {
    header_bytes: AtomicU64,
    data_bytes: AtomicU64,
    effective_header_bytes: AtomicU64,
    effective_data_bytes: AtomicU64,
    num_blocks: AtomicU64,
    failed_attempts: AtomicU64,
    error_code: AtomicU8,
    remote_error_code: AtomicU8,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record protocol header bytes consumed from the wire.
    pub fn add_header_bytes(&self, bytes: u64) {
        self.header_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record block payload bytes consumed from the wire.
    pub fn add_data_bytes(&self, bytes: u64) {
        self.data_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Credit header and payload bytes for a fully received block (or the
    /// DONE exchange).
    pub fn add_effective_bytes(&self, header_bytes: u64, data_bytes: u64) {
        self.effective_header_bytes
            .fetch_add(header_bytes, Ordering::Relaxed);
        self.effective_data_bytes
            .fetch_add(data_bytes, Ordering::Relaxed);
    }

    pub fn incr_num_blocks(&self) {
        self.num_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed_attempts(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_error_code(&self, code: ErrorCode) {
        self.error_code.store(code.as_u8(), Ordering::Relaxed);
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_u8(self.error_code.load(Ordering::Relaxed))
    }

    pub fn set_remote_error_code(&self, code: ErrorCode) {
        self.remote_error_code.store(code.as_u8(), Ordering::Relaxed);
    }

    pub fn remote_error_code(&self) -> ErrorCode {
        ErrorCode::from_u8(self.remote_error_code.load(Ordering::Relaxed))
    }

    pub fn header_bytes(&self) -> u64 {
        self.header_bytes.load(Ordering::Relaxed)
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes.load(Ordering::Relaxed)
    }

    pub fn effective_header_bytes(&self) -> u64 {
        self.effective_header_bytes.load(Ordering::Relaxed)
    }

    pub fn effective_data_bytes(&self) -> u64 {
        self.effective_data_bytes.load(Ordering::Relaxed)
    }

    /// Combined effective bytes, header and payload.
    pub fn effective_bytes(&self) -> u64 {
        self.effective_header_bytes() + self.effective_data_bytes()
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Every byte consumed from the wire so far, header and payload alike.
    /// This is the scalar the stall watchdog samples.
    pub fn total_bytes(&self) -> u64 {
        self.header_bytes() + self.data_bytes()
    }
}

/// Frozen per-port counters captured when a session finishes.
#[derive(Debug, Clone)]
pub struct PortReport {
    pub port: u16,
    pub header_bytes: u64,
    pub data_bytes: u64,
    pub effective_bytes: u64,
    pub num_blocks: u64,
    pub failed_attempts: u64,
    pub error_code: ErrorCode,
    pub remote_error_code: ErrorCode,
}

impl PortReport {
    pub fn snapshot(port: u16, stats: &TransferStats) -> Self {
        Self {
            port,
            header_bytes: stats.header_bytes(),
            data_bytes: stats.data_bytes(),
            effective_bytes: stats.effective_bytes(),
            num_blocks: stats.num_blocks(),
            failed_attempts: stats.failed_attempts(),
            error_code: stats.error_code(),
            remote_error_code: stats.remote_error_code(),
        }
    }
}

/// Aggregated outcome of a receive session, one entry per port.
#[derive(Debug, Clone)]
pub struct TransferReport {
    ports: Vec<PortReport>,
}

impl TransferReport {
    pub fn new(ports: Vec<PortReport>) -> Self {
        Self { ports }
    }

    pub fn port_reports(&self) -> &[PortReport] {
        &self.ports
    }

    pub fn total_bytes(&self) -> u64 {
        self.ports
            .iter()
            .map(|p| p.header_bytes + p.data_bytes)
            .sum()
    }

    pub fn effective_bytes(&self) -> u64 {
        self.ports.iter().map(|p| p.effective_bytes).sum()
    }

    pub fn num_blocks(&self) -> u64 {
        self.ports.iter().map(|p| p.num_blocks).sum()
    }

    pub fn failed_attempts(&self) -> u64 {
        self.ports.iter().map(|p| p.failed_attempts).sum()
    }

    /// First non-OK local code across the ports, or OK.
    pub fn error_code(&self) -> ErrorCode {
        self.ports
            .iter()
            .map(|p| p.error_code)
            .find(|c| !c.is_ok())
            .unwrap_or(ErrorCode::Ok)
    }

    /// First non-OK sender-reported code across the ports, or OK.
    pub fn remote_error_code(&self) -> ErrorCode {
        self.ports
            .iter()
            .map(|p| p.remote_error_code)
            .find(|c| !c.is_ok())
            .unwrap_or(ErrorCode::Ok)
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks={} effective_bytes={} total_bytes={} failed_attempts={} status={} remote={}",
            self.num_blocks(),
            self.effective_bytes(),
            self.total_bytes(),
            self.failed_attempts(),
            self.error_code(),
            self.remote_error_code()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accounting() {
        let stats = TransferStats::new();
        stats.add_header_bytes(10);
        stats.add_data_bytes(100);
        stats.add_effective_bytes(10, 100);
        stats.incr_num_blocks();

        assert_eq!(stats.header_bytes(), 10);
        assert_eq!(stats.data_bytes(), 100);
        assert_eq!(stats.effective_header_bytes(), 10);
        assert_eq!(stats.effective_data_bytes(), 100);
        assert_eq!(stats.effective_bytes(), 110);
        assert_eq!(stats.num_blocks(), 1);
        assert_eq!(stats.total_bytes(), 110);
    }

    #[test]
    fn test_error_codes_default_ok() {
        let stats = TransferStats::new();
        assert_eq!(stats.error_code(), ErrorCode::Ok);
        assert_eq!(stats.remote_error_code(), ErrorCode::Ok);
    }

    #[test]
    fn test_error_code_overwrite() {
        let stats = TransferStats::new();
        stats.set_error_code(ErrorCode::ProtocolError);
        stats.set_error_code(ErrorCode::FileWriteError);
        assert_eq!(stats.error_code(), ErrorCode::FileWriteError);

        stats.set_error_code(ErrorCode::Ok);
        assert_eq!(stats.error_code(), ErrorCode::Ok);
    }

    #[test]
    fn test_report_sums_ports() {
        let a = TransferStats::new();
        a.add_header_bytes(5);
        a.add_data_bytes(50);
        a.add_effective_bytes(5, 50);
        a.incr_num_blocks();

        let b = TransferStats::new();
        b.add_header_bytes(3);
        b.add_data_bytes(30);
        b.incr_failed_attempts();

        let report = TransferReport::new(vec![
            PortReport::snapshot(9000, &a),
            PortReport::snapshot(9001, &b),
        ]);

        assert_eq!(report.total_bytes(), 88);
        assert_eq!(report.effective_bytes(), 55);
        assert_eq!(report.num_blocks(), 1);
        assert_eq!(report.failed_attempts(), 1);
        assert_eq!(report.port_reports().len(), 2);
    }

    #[test]
    fn test_report_first_non_ok_code() {
        let ok = TransferStats::new();
        let bad = TransferStats::new();
        bad.set_error_code(ErrorCode::ConnError);
        bad.set_remote_error_code(ErrorCode::Error);

        let report = TransferReport::new(vec![
            PortReport::snapshot(9000, &ok),
            PortReport::snapshot(9001, &bad),
        ]);

        assert_eq!(report.error_code(), ErrorCode::ConnError);
        assert_eq!(report.remote_error_code(), ErrorCode::Error);
    }

    #[test]
    fn test_report_display() {
        let stats = TransferStats::new();
        stats.add_header_bytes(2);
        stats.add_effective_bytes(2, 0);
        let report = TransferReport::new(vec![PortReport::snapshot(9000, &stats)]);

        let text = report.to_string();
        assert!(text.contains("effective_bytes=2"));
        assert!(text.contains("status=OK"));
    }
}
