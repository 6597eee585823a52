//! Receiver session controller.
//!
//! A [`Receiver`] owns one worker thread per port plus a progress watchdog.
//! Sessions come in two flavours: a *joinable* session ends once every
//! worker has seen a DONE command ([`Receiver::transfer_async`] followed by
//! [`Receiver::finish`]), while a *daemon* session re-accepts connections
//! indefinitely ([`Receiver::run_forever`]).

mod thread;

use crate::config::ReceiverOptions;
use crate::error::TransferError;
use crate::file_creator::FileCreator;
use crate::socket::{ServerSocket, ShutdownHandle};
use crate::stats::{PortReport, TransferReport, TransferStats};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thread::{ReceiverThread, WorkerConfig};
use tracing::{error, info, trace, warn};

/// Session-finished flag shared between the control thread and the
/// progress tracker. The mutex is held only to read or flip the flag; the
/// condition variable wakes the tracker early when the session ends.
struct SessionState {
    finished: Mutex<bool>,
    recv_finished: Condvar,
}

/// Server side of a multi-connection transfer: accepts file blocks on a
/// range of consecutive ports and writes them under a destination
/// directory.
pub struct Receiver {
    ports: Vec<u16>,
    dest_dir: PathBuf,
    options: ReceiverOptions,
    joinable: bool,
    state: Arc<SessionState>,
    workers: Vec<JoinHandle<()>>,
    tracker: Option<JoinHandle<()>>,
    thread_stats: Vec<Arc<TransferStats>>,
    sockets: Vec<ShutdownHandle>,
}

impl Receiver {
    /// Create an idle receiver listening on `num_sockets` consecutive
    /// ports starting at `base_port`. Files land in the current directory
    /// until [`Receiver::set_dir`] points elsewhere.
    pub fn new(base_port: u16, num_sockets: usize, options: ReceiverOptions) -> Self {
        let ports = (0..num_sockets).map(|i| base_port + i as u16).collect();
        Self {
            ports,
            dest_dir: PathBuf::from("."),
            options,
            joinable: false,
            state: Arc::new(SessionState {
                finished: Mutex::new(true),
                recv_finished: Condvar::new(),
            }),
            workers: Vec::new(),
            tracker: None,
            thread_stats: Vec::new(),
            sockets: Vec::new(),
        }
    }

    /// Set the destination directory for received files.
    pub fn set_dir(&mut self, dest_dir: impl Into<PathBuf>) {
        self.dest_dir = dest_dir.into();
    }

    /// The ports this receiver listens on.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Whether a session is currently running.
    pub fn has_pending_transfer(&self) -> bool {
        !*self.state.finished.lock().unwrap()
    }

    fn mark_transfer_finished(&self, finished: bool) {
        let mut guard = self.state.finished.lock().unwrap();
        *guard = finished;
        if finished {
            self.state.recv_finished.notify_all();
        }
    }

    /// Start a joinable session and return immediately. The session ends
    /// once every worker has seen a DONE command; call
    /// [`Receiver::finish`] to collect the report.
    pub fn transfer_async(&mut self) -> Result<(), TransferError> {
        if self.has_pending_transfer() {
            error!("there is already a transfer running on this receiver");
            return Err(TransferError::TransferPending);
        }
        self.joinable = true;
        self.start();
        Ok(())
    }

    /// Run as a daemon, re-accepting transfers indefinitely.
    ///
    /// Daemon workers never observe a session end, so the internal
    /// [`Receiver::finish`] blocks forever and this method does not
    /// return under normal operation.
    pub fn run_forever(&mut self) -> Result<(), TransferError> {
        if self.has_pending_transfer() {
            error!("there is already a transfer running on this receiver");
            return Err(TransferError::TransferPending);
        }
        self.joinable = false;
        self.start();
        self.finish();
        Err(TransferError::Network(
            "run_forever returned unexpectedly".to_string(),
        ))
    }

    /// Spawn the per-port workers (and, for joinable sessions, the
    /// progress tracker).
    fn start(&mut self) {
        info!(
            ports = ?self.ports,
            dir = %self.dest_dir.display(),
            "starting receiver session"
        );
        self.mark_transfer_finished(false);
        let buffer_size = self.options.effective_buffer_size();
        if buffer_size != self.options.buffer_size {
            info!(
                requested = self.options.buffer_size,
                using = buffer_size,
                "buffer size below the protocol header bound, rounded up"
            );
        }
        let creator = Arc::new(FileCreator::new(self.dest_dir.clone()));
        for &port in &self.ports {
            let stats = Arc::new(TransferStats::new());
            let socket = ServerSocket::new(port, self.options.backlog);
            self.sockets.push(socket.shutdown_handle());
            self.thread_stats.push(Arc::clone(&stats));
            let worker = ReceiverThread::new(
                socket,
                Arc::clone(&creator),
                stats,
                WorkerConfig {
                    buffer_size,
                    skip_writes: self.options.skip_writes,
                    max_retries: self.options.max_retries,
                    sleep_millis: self.options.sleep_millis,
                    joinable: self.joinable,
                },
            );
            self.workers.push(std::thread::spawn(move || worker.run()));
        }
        if self.joinable {
            let state = Arc::clone(&self.state);
            let stats = self.thread_stats.clone();
            let sockets = self.sockets.clone();
            let interval_millis = self.options.timeout_check_interval_millis;
            let failed_checks = self.options.failed_timeout_checks;
            self.tracker = Some(std::thread::spawn(move || {
                progress_tracker(state, stats, sockets, interval_millis, failed_checks)
            }));
        }
    }

    /// Join the workers, mark the session finished, join the tracker and
    /// build the end-of-session report.
    ///
    /// In daemon mode the workers never return, so this call blocks
    /// forever; see [`Receiver::run_forever`].
    pub fn finish(&mut self) -> TransferReport {
        if !self.joinable {
            warn!("receiver is not joinable; the workers never finish and this call will not return");
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("receiver worker panicked");
            }
        }
        // Marking the transfer finished is what allows the next
        // transfer_async or run_forever on this instance.
        self.mark_transfer_finished(true);
        if let Some(tracker) = self.tracker.take() {
            if tracker.join().is_err() {
                error!("progress tracker panicked");
            }
        }
        let report = TransferReport::new(
            self.ports
                .iter()
                .zip(self.thread_stats.iter())
                .map(|(&port, stats)| PortReport::snapshot(port, stats))
                .collect(),
        );
        warn!("receiver transfer has been finished");
        info!(%report, "transfer report");
        self.thread_stats.clear();
        self.sockets.clear();
        report
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.has_pending_transfer() {
            warn!("receiver dropped with an ongoing transfer, trying to finish it");
            self.finish();
        }
    }
}

/// Stall watchdog. Samples the aggregate byte count at a fixed interval;
/// after more than `failed_checks` consecutive zero-delta samples it shuts
/// down every worker's sockets and exits.
///
/// The tracker never records error codes on workers: it only forces their
/// sockets closed, and each worker records whatever its interrupted
/// syscall reports (which can even be OK if a read completes cleanly
/// first).
fn progress_tracker(
    state: Arc<SessionState>,
    stats: Vec<Arc<TransferStats>>,
    sockets: Vec<ShutdownHandle>,
    interval_millis: i64,
    failed_checks: u64,
) {
    if interval_millis < 0 {
        return;
    }
    info!(
        interval_millis,
        failed_checks, "progress tracker started"
    );
    let interval = Duration::from_millis(interval_millis as u64);
    let mut total_bytes = 0u64;
    let mut zero_progress_count = 0u64;
    loop {
        let done = {
            let guard = state.finished.lock().unwrap();
            let (guard, _timeout) = state.recv_finished.wait_timeout(guard, interval).unwrap();
            *guard
        };
        if done {
            break;
        }
        let current: u64 = stats.iter().map(|s| s.total_bytes()).sum();
        let delta = current - total_bytes;
        total_bytes = current;
        if delta == 0 {
            zero_progress_count += 1;
        } else {
            zero_progress_count = 0;
        }
        trace!(delta, zero_progress_count, "progress sample");
        if zero_progress_count > failed_checks {
            info!(failed_checks, "no progress, shutting down receiver sockets");
            for handle in &sockets {
                if let Err(e) = handle.shutdown_listener() {
                    warn!(port = handle.port(), error = %e, "could not shut down listening socket");
                }
            }
            for handle in &sockets {
                if let Err(e) = handle.shutdown_connection() {
                    warn!(port = handle.port(), error = %e, "could not shut down accepted socket");
                }
            }
            return;
        }
    }
}
