//! Coordinator side of an off-chain VM validator set.
//!
//! A fixed set of validators jointly signs assertions about a deterministic
//! VM's execution. One validator leads: it admits the others over
//! authenticated TLS websockets, batches inbound off-chain messages, and
//! drives three round protocols (VM creation, disputable assertion,
//! unanimous assertion), each of which needs a signature from every other
//! validator over a canonical digest before the on-chain driver settles it.
//!
//! Architecture:
//! - Every mutable table (live followers, pending rounds, queued messages)
//!   is owned by exactly one task and reached through typed channels
//! - Per-follower I/O runs on dedicated reader/writer tasks
//! - The controller serializes rounds: at most one in flight at any instant

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod manager;
pub mod queue;
pub mod server;
pub mod types;
pub mod validators;
pub mod wire;

pub use config::CoordinatorConfig;
pub use coordinator::ValidatorCoordinator;
pub use driver::{ConfirmationHandles, DriverError, UnanimousHandles, VmDriver};
pub use error::CoordinationError;
pub use queue::QueueHandle;
pub use types::*;
pub use validators::ValidatorSet;
