//! Coordinator configuration.

use std::time::Duration;

/// Tunable parameters for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address the TLS listener binds to.
    pub listen_addr: String,
    /// Deadline for writing a single outbound frame.
    pub write_wait: Duration,
    /// How long a follower may stay silent before its connection is dropped.
    /// Must exceed `ping_period`.
    pub pong_wait: Duration,
    /// Liveness ping interval, about 0.9 x `pong_wait`.
    pub ping_period: Duration,
    /// Largest accepted websocket frame.
    pub max_frame_bytes: usize,
    /// Outbound buffer per follower; overflowing it evicts the follower.
    pub outbound_buffer: usize,
    /// Inbound buffer per follower.
    pub inbound_buffer: usize,
    /// Single-shot deadline for collecting follower signatures in a round.
    pub gather_timeout: Duration,
    /// Cadence of the idle drain check on the controller.
    pub tick_interval: Duration,
    /// Deadline for the admission handshake.
    pub handshake_timeout: Duration,
    /// Step bound handed to the driver for each assertion.
    pub max_assertion_steps: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1236".to_string(),
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            max_frame_bytes: 1024 * 1024,
            outbound_buffer: 128,
            inbound_buffer: 128,
            gather_timeout: Duration::from_secs(20),
            tick_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            max_assertion_steps: 10_000,
        }
    }
}
