use std::fmt;

use uuid::Uuid;

/// Opaque user identifier supplied by the authentication layer.
pub type UserId = String;

/// Process-unique connection identifier, generated at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of the connection an inbound event arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundContext {
    pub conn_id: ConnectionId,
    pub user_id: UserId,
}
