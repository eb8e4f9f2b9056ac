//! Inbound event decoding and the business-logic dispatch point.
//!
//! Implementors of [`EventHandler`] provide domain logic (typing relays,
//! read receipts) while the hub handles connection management, identity
//! correction and precondition checks.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use flippy_protocol::{Event, EventType};
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::types::InboundContext;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling events sent by clients.
///
/// The read pump decodes each message, forces `user_id` to the owner of
/// the connection, fills a missing timestamp and checks the per-type
/// preconditions before calling one of these methods. Each method gets a
/// [`Hub`] handle for replies and fan-out.
///
/// Default implementations only log, so handlers override what they need.
pub trait EventHandler: Send + Sync + 'static {
    /// Called for `typing`. `chat_id` is guaranteed non-empty.
    fn on_typing(
        &self,
        hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        let _ = (hub, event);
        Box::pin(async move {
            debug!(conn_id = %ctx.conn_id, %chat_id, "typing event not handled");
        })
    }

    /// Called for `stop_typing`. `chat_id` is guaranteed non-empty.
    fn on_stop_typing(
        &self,
        hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        let _ = (hub, event);
        Box::pin(async move {
            debug!(conn_id = %ctx.conn_id, %chat_id, "stop_typing event not handled");
        })
    }

    /// Called for `message_read`. Both ids are guaranteed non-empty.
    fn on_message_read(
        &self,
        hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        message_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        let _ = (hub, event);
        Box::pin(async move {
            debug!(
                conn_id = %ctx.conn_id,
                %chat_id,
                %message_id,
                "message_read event not handled"
            );
        })
    }

    /// Called for event types the hub does not route.
    fn on_unhandled(&self, hub: Hub, ctx: InboundContext, event: Event) -> HandlerFuture<'_> {
        let _ = hub;
        Box::pin(async move {
            warn!(conn_id = %ctx.conn_id, event_type = %event.event_type, "unhandled event type");
        })
    }

    /// Called once the connection is registered and its pumps are running.
    fn on_connected(&self, hub: Hub, ctx: InboundContext) -> HandlerFuture<'_> {
        let _ = (hub, ctx);
        Box::pin(async {})
    }

    /// Called after the connection has been deregistered (cleanup hook).
    fn on_disconnected(&self, hub: Hub, ctx: InboundContext) -> HandlerFuture<'_> {
        let _ = (hub, ctx);
        Box::pin(async {})
    }
}

/// Handler that keeps every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

/// Decodes and dispatches one inbound message.
pub(crate) async fn handle_inbound(hub: &Hub, ctx: &InboundContext, data: &[u8]) {
    if let Some(event) = decode_inbound(data, ctx, Utc::now()) {
        dispatch(hub, ctx, event).await;
    }
}

/// Decodes an inbound message and normalises it for dispatch.
///
/// Returns `None` for malformed JSON. The sender is always the owner of the
/// connection: a different `user_id` on the wire is logged and replaced.
pub(crate) fn decode_inbound(
    data: &[u8],
    ctx: &InboundContext,
    received_at: DateTime<Utc>,
) -> Option<Event> {
    let mut event: Event = match serde_json::from_slice(data) {
        Ok(e) => e,
        Err(e) => {
            warn!(conn_id = %ctx.conn_id, "invalid event JSON: {e}");
            return None;
        }
    };

    if let Some(claimed) = event.user_id().filter(|claimed| *claimed != ctx.user_id) {
        warn!(
            conn_id = %ctx.conn_id,
            user_id = %ctx.user_id,
            claimed,
            "user id mismatch in inbound event, using connection owner"
        );
    }
    event.user_id = Some(ctx.user_id.clone());
    event.stamp(received_at);

    Some(event)
}

/// Routes a decoded event to the matching handler method.
pub(crate) async fn dispatch(hub: &Hub, ctx: &InboundContext, event: Event) {
    let handler = hub.handler();
    let event_type = event.event_type;

    match event_type {
        EventType::Typing | EventType::StopTyping => {
            let Some(chat_id) = event.chat_id().map(str::to_owned) else {
                warn!(conn_id = %ctx.conn_id, %event_type, "event without chat_id, skipping");
                return;
            };
            if event_type == EventType::Typing {
                handler.on_typing(hub.clone(), ctx.clone(), chat_id, event).await;
            } else {
                handler.on_stop_typing(hub.clone(), ctx.clone(), chat_id, event).await;
            }
        }
        EventType::MessageRead => {
            let (Some(chat_id), Some(message_id)) = (
                event.chat_id().map(str::to_owned),
                event.message_id().map(str::to_owned),
            ) else {
                warn!(
                    conn_id = %ctx.conn_id,
                    %event_type,
                    "event without chat_id or message_id, skipping"
                );
                return;
            };
            handler
                .on_message_read(hub.clone(), ctx.clone(), chat_id, message_id, event)
                .await;
        }
        t if t.is_outbound_only() => {
            warn!(conn_id = %ctx.conn_id, event_type = %t, "client sent server-only event, ignoring");
        }
        _ => handler.on_unhandled(hub.clone(), ctx.clone(), event).await,
    }
}
