//! Hub tuning knobs.

use std::time::Duration;

use flippy_protocol::constants::{
    MAX_MESSAGE_SIZE, READ_DEADLINE, SEND_BUFFER_SIZE, WRITE_WAIT, ping_period_for,
};

use crate::HubError;

/// Heartbeat, sizing and backpressure settings.
///
/// The ping period is not configurable on its own: it is always derived
/// from `read_deadline` so the probe fires before the deadline lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Window in which the peer must answer a ping.
    pub read_deadline: Duration,
    /// Deadline for each frame write.
    pub write_wait: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity per connection.
    pub send_buffer_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            read_deadline: READ_DEADLINE,
            write_wait: WRITE_WAIT,
            max_message_size: MAX_MESSAGE_SIZE,
            send_buffer_size: SEND_BUFFER_SIZE,
        }
    }
}

impl HubConfig {
    /// Interval between pings (9/10 of the read deadline).
    pub fn ping_period(&self) -> Duration {
        ping_period_for(self.read_deadline)
    }

    /// Checks the settings can drive a working heartbeat.
    pub fn validate(&self) -> Result<(), HubError> {
        if self.ping_period().is_zero() {
            return Err(HubError::InvalidConfig("read_deadline is too short"));
        }
        if self.write_wait.is_zero() {
            return Err(HubError::InvalidConfig("write_wait must be non-zero"));
        }
        if self.max_message_size == 0 {
            return Err(HubError::InvalidConfig("max_message_size must be non-zero"));
        }
        if self.send_buffer_size == 0 {
            return Err(HubError::InvalidConfig("send_buffer_size must be non-zero"));
        }
        Ok(())
    }
}
