//! Per-connection pumps: read/write loops, ping/pong, send buffering.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::HubConfig;
use crate::handler;
use crate::hub::Hub;
use crate::types::{ConnectionId, InboundContext};

/// Inbound messages waiting for the handler, per connection.
const INBOUND_BUFFER_SIZE: usize = 64;

/// Handle to a live connection, as stored in the registry.
///
/// Cloneable and cheap: wraps the outbound queue sender and the
/// connection's cancel token.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: Arc<str>,
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle plus the receiving end of its outbound queue.
    pub(crate) fn new(
        id: ConnectionId,
        user_id: &str,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            id,
            user_id: Arc::from(user_id),
            tx,
            cancel,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Returns `true` once the connection has been told to close or its
    /// write pump is gone.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Offers a frame to the outbound queue without waiting.
    pub(crate) fn offer(&self, frame: WsMessage) -> Result<(), TrySendError<WsMessage>> {
        self.tx.try_send(frame)
    }

    /// Signals both pumps to stop. The write pump sends a close frame.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

/// Why a frame could not be written.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WriteError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("write deadline of {0:?} exceeded")]
    Deadline(Duration),
}

/// Starts the read and write pumps for a registered connection.
///
/// The pumps run as background tokio tasks and stop together: whichever
/// exits first cancels the other. The read task then deregisters the
/// connection and fires the disconnect hook.
pub(crate) fn spawn_pumps<S>(
    ws: S,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<WsMessage>,
    hub: Hub,
) where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (ws_sink, ws_stream) = ws.split();
    let ctx = InboundContext {
        conn_id: handle.id(),
        user_id: handle.user_id().to_owned(),
    };
    let cancel = handle.cancel.clone();

    // Write pump.
    tokio::spawn(write_pump(
        ws_sink,
        rx,
        ctx.conn_id,
        hub.config().clone(),
        cancel.clone(),
    ));

    // Read pump. Holding `handle` keeps the queue open until the pumps stop,
    // so a bare deregister does not close the transport.
    tokio::spawn(async move {
        let handler = Arc::clone(hub.handler());
        tokio::select! {
            _ = cancel.cancelled() => {}
            () = handler.on_connected(hub.clone(), ctx.clone()) => {}
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER_SIZE);
        let dispatcher = tokio::spawn(dispatch_loop(
            inbound_rx,
            ctx.clone(),
            hub.clone(),
            cancel.clone(),
        ));

        read_pump(ws_stream, &ctx, &hub, inbound_tx, cancel.clone()).await;

        // When read pump exits, cancel the write pump and the dispatcher too.
        cancel.cancel();
        if let Err(e) = dispatcher.await {
            error!(conn_id = %ctx.conn_id, "dispatch task failed: {e}");
        }
        hub.deregister(ctx.conn_id).await;
        drop(handle);
        handler.on_disconnected(hub.clone(), ctx.clone()).await;
        info!(conn_id = %ctx.conn_id, user_id = %ctx.user_id, "connection closed");
    });
}

/// Write pump: drains the outbound queue and sends pings.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<WsMessage>,
    conn_id: ConnectionId,
    config: HubConfig,
    cancel: CancellationToken,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin,
{
    let period = config.ping_period();
    let mut ping_interval = tokio::time::interval_at(Instant::now() + period, period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => match msg {
                Some(frame) => frame,
                None => break, // Channel closed.
            },

            _ = ping_interval.tick() => {
                trace!(%conn_id, "sending ping");
                WsMessage::Ping(Vec::new().into())
            }
        };

        // A stalled peer must not hold the pump past cancellation.
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = write_frame(&mut sink, frame, config.write_wait) => result,
        };

        if let Err(e) = result {
            error!(%conn_id, "write pump error: {e}");
            cancel.cancel();
            return;
        }
    }

    // Best-effort close frame.
    if let Err(e) = write_frame(&mut sink, WsMessage::Close(None), config.write_wait).await {
        debug!(%conn_id, "close frame not delivered: {e}");
    }
    cancel.cancel();
}

/// Writes one frame under the write deadline.
pub(crate) async fn write_frame<S>(
    sink: &mut S,
    frame: WsMessage,
    wait: Duration,
) -> Result<(), WriteError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(wait, sink.send(frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(WriteError::Deadline(wait)),
    }
}

/// Read pump: reads frames, renews the deadline on pong and queues events.
///
/// Handlers never run here, so a slow handler cannot hold back pongs or
/// cancellation.
async fn read_pump<S>(
    mut stream: S,
    ctx: &InboundContext,
    hub: &Hub,
    inbound: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Send + Unpin,
{
    let read_deadline = hub.config().read_deadline;
    let pong_deadline = tokio::time::sleep(read_deadline);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!(conn_id = %ctx.conn_id, user_id = %ctx.user_id, "pong timeout, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => match ws_msg {
                        WsMessage::Text(_) | WsMessage::Binary(_) => {
                            enqueue_inbound(hub, ctx, &inbound, ws_msg);
                        }
                        WsMessage::Pong(_) => {
                            trace!(conn_id = %ctx.conn_id, "received pong");
                            pong_deadline.as_mut().reset(Instant::now() + read_deadline);
                        }
                        WsMessage::Ping(_) => {
                            // tungstenite queues the pong reply itself.
                            trace!(conn_id = %ctx.conn_id, "received ping");
                        }
                        WsMessage::Close(frame) => {
                            debug!(conn_id = %ctx.conn_id, ?frame, "received close frame");
                            break;
                        }
                        WsMessage::Frame(_) => {} // Raw frames ignored.
                    },
                    Some(Err(e)) => {
                        error!(conn_id = %ctx.conn_id, "read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Size-checks one inbound message and offers it to the dispatcher.
///
/// A full inbound queue drops the message rather than stalling reads.
fn enqueue_inbound(
    hub: &Hub,
    ctx: &InboundContext,
    inbound: &mpsc::Sender<WsMessage>,
    msg: WsMessage,
) {
    let max = hub.config().max_message_size;
    let len = msg.len();
    if len > max {
        warn!(
            conn_id = %ctx.conn_id,
            "message exceeds max size ({len} > {max}), dropping"
        );
        return;
    }
    match inbound.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(conn_id = %ctx.conn_id, user_id = %ctx.user_id, "inbound queue full, dropping message");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(conn_id = %ctx.conn_id, "dispatcher gone, dropping message");
        }
    }
}

/// Runs handlers for queued messages one at a time, in arrival order.
///
/// Each handler call is raced against cancellation so a hung handler does
/// not keep the connection alive after close or shutdown.
async fn dispatch_loop(
    mut inbound: mpsc::Receiver<WsMessage>,
    ctx: InboundContext,
    hub: Hub,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let data: &[u8] = match &msg {
            WsMessage::Text(text) => text.as_str().as_bytes(),
            WsMessage::Binary(data) => &data[..],
            _ => continue,
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn_id = %ctx.conn_id, "connection closing, handler abandoned");
                break;
            }
            () = handler::handle_inbound(&hub, &ctx, data) => {}
        }
    }
}

#[cfg(test)]
impl ConnectionHandle {
    /// A handle whose queue has no consumer.
    pub(crate) fn detached(id: ConnectionId, user_id: &str, capacity: usize) -> Self {
        Self::new(id, user_id, capacity, CancellationToken::new()).0
    }
}
