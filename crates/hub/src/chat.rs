//! Default chat handler: relays client events to the other chat members.

use flippy_protocol::Event;
use tracing::warn;

use crate::handler::{EventHandler, HandlerFuture};
use crate::hub::Hub;
use crate::types::InboundContext;

/// Relays typing indicators and read receipts between chat members.
///
/// `typing` and `stop_typing` go to every member but the sender.
/// `message_read` is recorded through the hub's [`ChatDirectory`] first and
/// only relayed once the store accepted it.
///
/// [`ChatDirectory`]: crate::ChatDirectory
#[derive(Debug, Default, Clone, Copy)]
pub struct ChatRelay;

impl EventHandler for ChatRelay {
    fn on_typing(
        &self,
        hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        Box::pin(async move { relay(&hub, &ctx, &chat_id, event).await })
    }

    fn on_stop_typing(
        &self,
        hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        Box::pin(async move { relay(&hub, &ctx, &chat_id, event).await })
    }

    fn on_message_read(
        &self,
        hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        message_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(directory) = hub.directory() else {
                warn!(conn_id = %ctx.conn_id, %chat_id, "no chat directory, dropping read receipt");
                return;
            };
            if let Err(e) = directory
                .mark_read(&chat_id, &message_id, &ctx.user_id)
                .await
            {
                warn!(conn_id = %ctx.conn_id, %chat_id, %message_id, "mark read failed: {e}");
                return;
            }
            relay(&hub, &ctx, &chat_id, event).await;
        })
    }
}

async fn relay(hub: &Hub, ctx: &InboundContext, chat_id: &str, event: Event) {
    if let Err(e) = hub.send_to_chat(chat_id, event, &ctx.user_id).await {
        warn!(conn_id = %ctx.conn_id, %chat_id, "chat relay failed: {e}");
    }
}
