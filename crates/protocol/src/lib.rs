pub mod constants;
pub mod event;

// Re-export primary types for convenience.
pub use constants::EventType;
pub use event::{Event, UnreadCountPayload};
