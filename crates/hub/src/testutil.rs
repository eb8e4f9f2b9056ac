//! Shared helpers for the hub's tests.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};

use crate::handler::{EventHandler, HandlerFuture};
use crate::hub::Hub;
use crate::types::{ConnectionId, InboundContext};
use flippy_protocol::Event;

pub(crate) type TestWs = WebSocketStream<DuplexStream>;

/// Server and client ends of an in-memory WebSocket.
///
/// `max_buf_size` bounds the pipe in each direction; a small value plus a
/// client that never reads simulates a stalled peer.
pub(crate) async fn ws_pair(max_buf_size: usize) -> (TestWs, TestWs) {
    let (server_io, client_io) = tokio::io::duplex(max_buf_size);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

/// Reads frames until an event arrives. Pings and pongs are skipped.
///
/// Returns `None` on timeout, close or a frame that is not an event.
pub(crate) async fn next_event(client: &mut TestWs, within: Duration) -> Option<Event> {
    let deadline = Instant::now() + within;
    loop {
        let frame = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
        match frame {
            Ok(WsMessage::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
            Ok(_) | Err(_) => return None,
        }
    }
}

/// Polls the registry until the connection is gone.
pub(crate) async fn wait_deregistered(hub: &Hub, id: ConnectionId, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if hub.registry().get(id).await.is_none() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// One handler call.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub kind: &'static str,
    pub ctx: InboundContext,
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
    pub event: Option<Event>,
}

/// Handler that reports every call on a channel.
pub(crate) struct RecordingHandler {
    tx: mpsc::UnboundedSender<Recorded>,
}

impl RecordingHandler {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Recorded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn record(
        &self,
        kind: &'static str,
        ctx: InboundContext,
        chat_id: Option<String>,
        message_id: Option<String>,
        event: Option<Event>,
    ) -> HandlerFuture<'_> {
        let _ = self.tx.send(Recorded {
            kind,
            ctx,
            chat_id,
            message_id,
            event,
        });
        Box::pin(async {})
    }
}

impl EventHandler for RecordingHandler {
    fn on_typing(
        &self,
        _hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        self.record("typing", ctx, Some(chat_id), None, Some(event))
    }

    fn on_stop_typing(
        &self,
        _hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        self.record("stop_typing", ctx, Some(chat_id), None, Some(event))
    }

    fn on_message_read(
        &self,
        _hub: Hub,
        ctx: InboundContext,
        chat_id: String,
        message_id: String,
        event: Event,
    ) -> HandlerFuture<'_> {
        self.record(
            "message_read",
            ctx,
            Some(chat_id),
            Some(message_id),
            Some(event),
        )
    }

    fn on_unhandled(&self, _hub: Hub, ctx: InboundContext, event: Event) -> HandlerFuture<'_> {
        self.record("unhandled", ctx, None, None, Some(event))
    }

    fn on_connected(&self, _hub: Hub, ctx: InboundContext) -> HandlerFuture<'_> {
        self.record("connected", ctx, None, None, None)
    }

    fn on_disconnected(&self, _hub: Hub, ctx: InboundContext) -> HandlerFuture<'_> {
        self.record("disconnected", ctx, None, None, None)
    }
}

/// Handler whose `on_typing` takes `delay`, or never finishes when `None`.
///
/// Reports `typing_started`, `typing_done` and `disconnected` on a channel.
pub(crate) struct SlowHandler {
    delay: Option<Duration>,
    tx: mpsc::UnboundedSender<&'static str>,
}

impl SlowHandler {
    pub(crate) fn new(delay: Option<Duration>) -> (Self, mpsc::UnboundedReceiver<&'static str>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { delay, tx }, rx)
    }
}

impl EventHandler for SlowHandler {
    fn on_typing(
        &self,
        _hub: Hub,
        _ctx: InboundContext,
        _chat_id: String,
        _event: Event,
    ) -> HandlerFuture<'_> {
        let _ = self.tx.send("typing_started");
        Box::pin(async move {
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
            let _ = self.tx.send("typing_done");
        })
    }

    fn on_disconnected(&self, _hub: Hub, _ctx: InboundContext) -> HandlerFuture<'_> {
        let _ = self.tx.send("disconnected");
        Box::pin(async {})
    }
}
