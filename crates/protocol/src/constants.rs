use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong before the connection is considered dead.
///
/// This acts as a read deadline: it is renewed every time the peer
/// acknowledges a ping. Other traffic does not extend it.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// How often to ping the peer. Always 9/10 of [`READ_DEADLINE`] so a healthy
/// peer's pong lands before the deadline lapses.
pub const PING_PERIOD: Duration = ping_period_for(READ_DEADLINE);

/// Time allowed to write a single frame (events, pings, close).
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Maximum inbound message size in bytes (512 KB).
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Per-connection outbound queue capacity, in frames.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Derives the ping period from a read deadline (9/10 of the window).
pub const fn ping_period_for(read_deadline: Duration) -> Duration {
    let nanos = read_deadline.as_nanos() / 10 * 9;
    Duration::from_nanos(nanos as u64)
}

/// Realtime event type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Pushed by business logic
    #[serde(rename = "new_message")]
    NewMessage,
    #[serde(rename = "message_delivered")]
    MessageDelivered,
    #[serde(rename = "unread_count")]
    UnreadCount,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "disconnected")]
    Disconnected,

    // Sent by clients
    #[serde(rename = "typing")]
    Typing,
    #[serde(rename = "stop_typing")]
    StopTyping,
    #[serde(rename = "message_read")]
    MessageRead,

    /// Forward compatibility: unknown event types deserialize here.
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::MessageDelivered => "message_delivered",
            Self::UnreadCount => "unread_count",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Typing => "typing",
            Self::StopTyping => "stop_typing",
            Self::MessageRead => "message_read",
            Self::Unknown => "unknown",
        }
    }

    /// Returns `true` for types only the server produces.
    pub fn is_outbound_only(&self) -> bool {
        matches!(
            self,
            Self::NewMessage
                | Self::MessageDelivered
                | Self::UnreadCount
                | Self::Connected
                | Self::Disconnected
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
