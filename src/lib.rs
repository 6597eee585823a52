//! Gust - warp-speed multi-connection file transfer receiver.
//!
//! Gust is the server side of a parallel TCP file-transfer service. A
//! sender opens one connection per port and streams file blocks; gust
//! writes them under a destination directory and reports per-connection
//! statistics when the session ends.
//!
//! # Features
//!
//! - **Parallel**: one blocking worker thread per port, no cross-port
//!   coordination on the hot path
//! - **Frugal**: a single fixed receive buffer per connection, reused
//!   across blocks with in-place leftover carry
//! - **Supervised**: a stall watchdog tears down sockets when no bytes
//!   arrive for a configured window
//!
//! # Example
//!
//! ```no_run
//! use gust::{Receiver, ReceiverOptions};
//!
//! # fn main() -> Result<(), gust::TransferError> {
//! let options = ReceiverOptions::default();
//! let mut receiver = Receiver::new(22356, 8, options);
//! receiver.set_dir("/tmp/incoming");
//! receiver.run_forever()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod file_creator;
pub mod protocol;
pub mod receiver;
pub mod socket;
pub mod stats;

pub use config::ReceiverOptions;
pub use error::{ErrorCode, TransferError};
pub use receiver::Receiver;
pub use stats::{PortReport, TransferReport, TransferStats};
