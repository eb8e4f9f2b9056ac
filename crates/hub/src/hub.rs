//! The hub: registration, targeted fan-out and shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use flippy_protocol::{Event, EventType, UnreadCountPayload};
use futures_util::{Sink, Stream};
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::HubError;
use crate::config::HubConfig;
use crate::connection::{self, ConnectionHandle};
use crate::directory::ChatDirectory;
use crate::handler::EventHandler;
use crate::registry::Registry;
use crate::types::{ConnectionId, UserId};

struct Inner {
    config: HubConfig,
    registry: Registry,
    handler: Arc<dyn EventHandler>,
    directory: Option<Arc<dyn ChatDirectory>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

/// Process-wide connection hub.
///
/// Cloneable and cheap: every clone shares the same registry. Create one
/// per process and hand clones to the request handlers that need to push
/// events.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    /// Creates a hub.
    ///
    /// `directory` resolves chat membership for [`send_to_chat`]; without
    /// one that call fails with [`HubError::NoDirectory`].
    ///
    /// [`send_to_chat`]: Self::send_to_chat
    pub fn new(
        config: HubConfig,
        handler: impl EventHandler,
        directory: Option<Arc<dyn ChatDirectory>>,
    ) -> Result<Self, HubError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry: Registry::new(),
                handler: Arc::new(handler),
                directory,
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn directory(&self) -> Option<&Arc<dyn ChatDirectory>> {
        self.inner.directory.as_ref()
    }

    pub(crate) fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.inner.handler
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Number of live connections owned by `user_id`.
    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.inner.registry.connections_for_user(user_id).await.len()
    }

    /// Returns `true` if the user has at least one live connection.
    pub async fn is_online(&self, user_id: &str) -> bool {
        self.user_connection_count(user_id).await > 0
    }

    /// Takes ownership of an established WebSocket and starts its pumps.
    ///
    /// The connection is visible to [`send_to_user`](Self::send_to_user)
    /// as soon as this returns.
    pub async fn register<S>(
        &self,
        ws: S,
        user_id: impl Into<UserId>,
    ) -> Result<ConnectionId, HubError>
    where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>>
            + Sink<WsMessage, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let user_id = user_id.into();
        if user_id.is_empty() {
            return Err(HubError::EmptyUserId);
        }
        if self.is_shut_down() {
            return Err(HubError::ShutDown);
        }

        let id = ConnectionId::new();
        let (handle, rx) = ConnectionHandle::new(
            id,
            &user_id,
            self.inner.config.send_buffer_size,
            self.inner.cancel.child_token(),
        );
        self.inner.registry.add(handle.clone()).await;

        // Shutdown may have drained the registry while we were adding.
        if self.is_shut_down() {
            self.inner.registry.remove(id).await;
            handle.close();
            return Err(HubError::ShutDown);
        }

        connection::spawn_pumps(ws, handle, rx, self.clone());
        info!(conn_id = %id, %user_id, "connection registered");
        Ok(id)
    }

    /// Removes a connection from the registry.
    ///
    /// Later sends stop targeting it. The transport is left to the pumps.
    /// Returns `false` if the connection was already gone.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        match self.inner.registry.remove(id).await {
            Some(handle) => {
                info!(conn_id = %id, user_id = %handle.user_id(), "connection deregistered");
                true
            }
            None => false,
        }
    }

    /// Delivers an event to every live connection of a user.
    ///
    /// Best-effort and non-blocking: offline users are skipped, and a
    /// connection whose queue is full is closed and deregistered instead of
    /// stalling the other recipients.
    pub async fn send_to_user(&self, user_id: &str, mut event: Event) {
        if user_id.is_empty() {
            return;
        }

        let handles = self.inner.registry.handles_for_user(user_id).await;
        if handles.is_empty() {
            trace!(%user_id, event_type = %event.event_type, "user offline, skipping");
            return;
        }

        event.stamp(Utc::now());
        let frame = match encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                error!(%user_id, "failed to serialize event: {e}");
                return;
            }
        };

        self.deliver(handles, &frame).await;
    }

    /// Delivers an event to every member of a chat except `exclude_user_id`.
    ///
    /// Membership is read from the [`ChatDirectory`] on every call. Fails
    /// only if the lookup fails; delivery itself is best-effort as in
    /// [`send_to_user`](Self::send_to_user).
    pub async fn send_to_chat(
        &self,
        chat_id: &str,
        mut event: Event,
        exclude_user_id: &str,
    ) -> Result<(), HubError> {
        let directory = self.inner.directory.as_ref().ok_or(HubError::NoDirectory)?;
        let members = directory.chat_members(chat_id).await?;

        if event.chat_id().is_none() {
            event.chat_id = Some(chat_id.to_owned());
        }
        event.stamp(Utc::now());
        let frame = encode(&event)?;

        let mut seen = HashSet::new();
        for member in members {
            if member.is_empty() || member == exclude_user_id || !seen.insert(member.clone()) {
                continue;
            }
            let handles = self.inner.registry.handles_for_user(&member).await;
            self.deliver(handles, &frame).await;
        }

        debug!(%chat_id, event_type = %event.event_type, recipients = seen.len(), "chat fan-out");
        Ok(())
    }

    /// Pushes the user's unread chat count.
    pub async fn broadcast_unread_count(&self, user_id: &str, count: i64) {
        let event = match Event::new(EventType::UnreadCount)
            .with_user(user_id)
            .with_timestamp(Utc::now())
            .with_payload(&UnreadCountPayload { count })
        {
            Ok(event) => event,
            Err(e) => {
                error!(%user_id, "failed to build unread count event: {e}");
                return;
            }
        };
        self.send_to_user(user_id, event).await;
    }

    /// Stops every pump, closes every transport and clears the registry.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("hub already shut down");
            return;
        }

        info!("hub shutting down");
        self.inner.cancel.cancel();

        let handles = self.inner.registry.drain().await;
        for handle in &handles {
            handle.close();
        }
        info!(closed = handles.len(), "hub shut down");
    }

    /// Offers one serialized frame to each connection.
    async fn deliver(&self, handles: Vec<ConnectionHandle>, frame: &WsMessage) {
        for handle in handles {
            match handle.offer(frame.clone()) {
                Ok(()) => trace!(conn_id = %handle.id(), "event queued"),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        conn_id = %handle.id(),
                        user_id = %handle.user_id(),
                        "send queue full, closing slow connection"
                    );
                    handle.close();
                    self.inner.registry.remove(handle.id()).await;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn_id = %handle.id(), "send queue closed, removing connection");
                    self.inner.registry.remove(handle.id()).await;
                }
            }
        }
    }
}

/// Serializes an event once for reuse across every target connection.
fn encode(event: &Event) -> Result<WsMessage, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(WsMessage::Text(json.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};

    use crate::directory::{DirectoryError, InMemoryDirectory};
    use crate::handler::NoopHandler;
    use crate::testutil::{RecordingHandler, SlowHandler, next_event, wait_deregistered, ws_pair};

    const ROOMY: usize = 64 * 1024;

    fn hub() -> Hub {
        Hub::new(HubConfig::default(), NoopHandler, None).unwrap()
    }

    fn event(n: usize) -> Event {
        Event::new(EventType::NewMessage)
            .with_chat("c1")
            .with_message(format!("m{n}"))
    }

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let config = HubConfig {
            send_buffer_size: 0,
            ..HubConfig::default()
        };
        assert!(matches!(
            Hub::new(config, NoopHandler, None),
            Err(HubError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn register_makes_connection_visible() {
        let hub = hub();
        let (server, _client) = ws_pair(ROOMY).await;

        let id = hub.register(server, "alice").await.unwrap();

        assert!(hub.is_online("alice").await);
        assert_eq!(hub.connection_count().await, 1);
        let handle = hub.registry().get(id).await.unwrap();
        assert_eq!(handle.user_id(), "alice");
        assert!(hub.registry().connections_for_user("alice").await.contains(&id));
    }

    #[tokio::test]
    async fn register_rejects_empty_user() {
        let hub = hub();
        let (server, _client) = ws_pair(ROOMY).await;
        assert!(matches!(
            hub.register(server, "").await,
            Err(HubError::EmptyUserId)
        ));
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_offline_user_is_noop() {
        let hub = hub();
        tokio::time::timeout(
            Duration::from_millis(100),
            hub.send_to_user("nobody", event(1)),
        )
        .await
        .expect("must not block");
        hub.send_to_user("", event(1)).await;
        assert!(!hub.is_online("nobody").await);
    }

    #[tokio::test]
    async fn send_to_user_reaches_every_connection_in_order() {
        let hub = hub();
        let (s1, mut phone) = ws_pair(ROOMY).await;
        let (s2, mut laptop) = ws_pair(ROOMY).await;
        let (s3, mut other) = ws_pair(ROOMY).await;
        hub.register(s1, "alice").await.unwrap();
        hub.register(s2, "alice").await.unwrap();
        hub.register(s3, "bob").await.unwrap();

        for n in 0..3 {
            hub.send_to_user("alice", event(n)).await;
        }

        for client in [&mut phone, &mut laptop] {
            for n in 0..3 {
                let got = next_event(client, Duration::from_secs(2)).await.unwrap();
                assert_eq!(got.event_type, EventType::NewMessage);
                assert_eq!(got.chat_id(), Some("c1"));
                assert_eq!(got.message_id, Some(format!("m{n}")));
                assert!(!got.timestamp_unset(), "hub stamps outbound events");
            }
        }
        assert!(next_event(&mut other, Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn deregister_stops_targeting_connection() {
        let hub = hub();
        let (server, mut client) = ws_pair(ROOMY).await;
        let id = hub.register(server, "alice").await.unwrap();

        assert!(hub.deregister(id).await);
        assert!(!hub.deregister(id).await);
        assert!(hub.registry().get(id).await.is_none());

        hub.send_to_user("alice", event(1)).await;
        assert!(next_event(&mut client, Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn stalled_connection_is_evicted() {
        let config = HubConfig {
            send_buffer_size: 4,
            ..HubConfig::default()
        };
        let hub = Hub::new(config, NoopHandler, None).unwrap();

        let (healthy_server, mut healthy) = ws_pair(ROOMY).await;
        // A tiny pipe the client never drains.
        let (stalled_server, _stalled) = ws_pair(64).await;
        let healthy_id = hub.register(healthy_server, "alice").await.unwrap();
        let stalled_id = hub.register(stalled_server, "alice").await.unwrap();

        const K: usize = 24;
        let reader = tokio::spawn(async move {
            let mut got = Vec::new();
            while got.len() < K {
                match next_event(&mut healthy, Duration::from_secs(5)).await {
                    Some(event) => got.push(event),
                    None => break,
                }
            }
            got
        });

        // The stalled pump holds one frame in its blocked write and the queue
        // holds `send_buffer_size` more, so the next send overflows.
        let overflow_at = hub.config().send_buffer_size + 1;
        for n in 0..K {
            hub.send_to_user("alice", event(n)).await;
            if n < overflow_at {
                assert!(
                    hub.registry().get(stalled_id).await.is_some(),
                    "evicted early at send {n}"
                );
            } else if n == overflow_at {
                assert!(
                    hub.registry().get(stalled_id).await.is_none(),
                    "overflowing send must evict"
                );
            }
            // Let the pumps take what was queued.
            tokio::task::yield_now().await;
        }

        assert!(hub.registry().get(stalled_id).await.is_none());
        assert!(hub.registry().get(healthy_id).await.is_some());
        assert_eq!(
            hub.registry().connections_for_user("alice").await,
            HashSet::from([healthy_id])
        );

        let got = reader.await.unwrap();
        assert_eq!(got.len(), K);
        for (n, event) in got.iter().enumerate() {
            assert_eq!(event.message_id, Some(format!("m{n}")));
        }
    }

    #[tokio::test]
    async fn unresponsive_peer_is_closed_within_deadline() {
        let config = HubConfig {
            read_deadline: Duration::from_millis(200),
            ..HubConfig::default()
        };
        let hub = Hub::new(config, NoopHandler, None).unwrap();

        // The client never reads, so it never answers pings.
        let (server, _client) = ws_pair(ROOMY).await;
        let id = hub.register(server, "alice").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hub.registry().get(id).await.is_some());

        let gone = wait_deregistered(&hub, id, Duration::from_millis(600)).await;
        assert!(gone, "connection should be dropped after the pong deadline");
        assert!(!hub.is_online("alice").await);
    }

    #[tokio::test]
    async fn responsive_peer_stays_open() {
        // 200ms deadline, 180ms ping period.
        let config = HubConfig {
            read_deadline: Duration::from_millis(200),
            ..HubConfig::default()
        };
        let hub = Hub::new(config, NoopHandler, None).unwrap();

        let (server, mut client) = ws_pair(ROOMY).await;
        let id = hub.register(server, "alice").await.unwrap();

        // Reading lets tungstenite answer every ping with a pong.
        let pings = tokio::spawn(async move {
            let mut pings = 0usize;
            while let Some(Ok(msg)) = client.next().await {
                if msg.is_ping() {
                    pings += 1;
                }
            }
            pings
        });

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(
            hub.registry().get(id).await.is_some(),
            "healthy peer must survive several deadline windows"
        );

        hub.shutdown().await;
        let pings = tokio::time::timeout(Duration::from_secs(2), pings)
            .await
            .expect("client should see the close")
            .unwrap();
        assert!(pings >= 2, "expected repeated pings, saw {pings}");
    }

    #[tokio::test]
    async fn slow_handler_does_not_starve_heartbeat() {
        let config = HubConfig {
            read_deadline: Duration::from_millis(200),
            ..HubConfig::default()
        };
        let (handler, mut calls) = SlowHandler::new(Some(Duration::from_millis(400)));
        let hub = Hub::new(config, handler, None).unwrap();

        let (server, mut client) = ws_pair(ROOMY).await;
        let id = hub.register(server, "alice").await.unwrap();

        for _ in 0..2 {
            client
                .send(WsMessage::Text(r#"{"type":"typing","chat_id":"c1"}"#.into()))
                .await
                .unwrap();
        }
        // Keep reading so every ping is answered while the handler works.
        let reader = tokio::spawn(async move { while let Some(Ok(_)) = client.next().await {} });

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(
            hub.registry().get(id).await.is_some(),
            "busy handler must not cost a healthy peer its connection"
        );

        let mut seen = Vec::new();
        while let Ok(call) = calls.try_recv() {
            seen.push(call);
        }
        assert_eq!(
            seen,
            ["typing_started", "typing_done", "typing_started", "typing_done"]
        );

        hub.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), reader).await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_stuck_handler() {
        let (handler, mut calls) = SlowHandler::new(None);
        let hub = Hub::new(HubConfig::default(), handler, None).unwrap();

        let (server, mut client) = ws_pair(ROOMY).await;
        let id = hub.register(server, "alice").await.unwrap();

        client
            .send(WsMessage::Text(r#"{"type":"typing","chat_id":"c1"}"#.into()))
            .await
            .unwrap();
        let started = tokio::time::timeout(Duration::from_secs(2), calls.recv())
            .await
            .unwrap();
        assert_eq!(started, Some("typing_started"));

        hub.shutdown().await;

        let next = tokio::time::timeout(Duration::from_secs(2), calls.recv())
            .await
            .expect("on_disconnected must fire despite the hung handler");
        assert_eq!(next, Some("disconnected"));
        assert!(hub.registry().get(id).await.is_none());
    }

    #[tokio::test]
    async fn client_close_deregisters() {
        let (handler, mut calls) = RecordingHandler::new();
        let hub = Hub::new(HubConfig::default(), handler, None).unwrap();
        let (server, mut client) = ws_pair(ROOMY).await;
        let id = hub.register(server, "alice").await.unwrap();

        client.close(None).await.unwrap();

        let gone = wait_deregistered(&hub, id, Duration::from_secs(2)).await;
        assert!(gone);

        let connected = calls.recv().await.unwrap();
        assert_eq!(connected.kind, "connected");
        let disconnected = calls.recv().await.unwrap();
        assert_eq!(disconnected.kind, "disconnected");
        assert_eq!(disconnected.ctx.conn_id, id);
    }

    #[tokio::test]
    async fn forged_user_id_is_corrected() {
        let (handler, mut calls) = RecordingHandler::new();
        let hub = Hub::new(HubConfig::default(), handler, None).unwrap();
        let (server, mut client) = ws_pair(ROOMY).await;
        hub.register(server, "alice").await.unwrap();
        assert_eq!(calls.recv().await.unwrap().kind, "connected");

        let forged = r#"{"type":"typing","chat_id":"c1","user_id":"mallory"}"#;
        client.send(WsMessage::Text(forged.into())).await.unwrap();

        let rec = tokio::time::timeout(Duration::from_secs(2), calls.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.kind, "typing");
        let event = rec.event.unwrap();
        assert_eq!(event.user_id.as_deref(), Some("alice"));
        assert_eq!(rec.ctx.user_id, "alice");
        assert!(!event.timestamp_unset());
    }

    #[tokio::test]
    async fn bad_messages_do_not_close_connection() {
        let (handler, mut calls) = RecordingHandler::new();
        let config = HubConfig {
            max_message_size: 128,
            ..HubConfig::default()
        };
        let hub = Hub::new(config, handler, None).unwrap();
        let (server, mut client) = ws_pair(ROOMY).await;
        let id = hub.register(server, "alice").await.unwrap();
        assert_eq!(calls.recv().await.unwrap().kind, "connected");

        let oversized = format!(
            r#"{{"type":"typing","chat_id":"c1","payload":"{}"}}"#,
            "x".repeat(256)
        );
        client.send(WsMessage::Text(oversized.into())).await.unwrap();
        client.send(WsMessage::Text("not json".into())).await.unwrap();
        client
            .send(WsMessage::Text(r#"{"type":"sticker"}"#.into()))
            .await
            .unwrap();
        client
            .send(WsMessage::Text(r#"{"type":"stop_typing","chat_id":"c1"}"#.into()))
            .await
            .unwrap();

        let unknown = calls.recv().await.unwrap();
        assert_eq!(unknown.kind, "unhandled");
        let stop = calls.recv().await.unwrap();
        assert_eq!(stop.kind, "stop_typing");
        assert!(hub.registry().get(id).await.is_some());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let hub = hub();
        let (s1, mut c1) = ws_pair(ROOMY).await;
        let (s2, mut c2) = ws_pair(ROOMY).await;
        hub.register(s1, "alice").await.unwrap();
        hub.register(s2, "bob").await.unwrap();

        hub.shutdown().await;

        assert!(hub.is_shut_down());
        assert!(hub.registry().is_empty().await);
        assert_eq!(hub.registry().user_count().await, 0);

        for client in [&mut c1, &mut c2] {
            let closed = tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    match client.next().await {
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    }
                }
            })
            .await;
            assert!(closed.is_ok(), "client should observe the close");
        }

        hub.send_to_user("alice", event(1)).await;
        hub.shutdown().await;

        let (s3, _c3) = ws_pair(ROOMY).await;
        assert!(matches!(
            hub.register(s3, "alice").await,
            Err(HubError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn send_to_chat_skips_excluded_user() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.upsert_chat("c1", ["alice", "bob", "bob"]).await;
        let hub = Hub::new(
            HubConfig::default(),
            NoopHandler,
            Some(directory as Arc<dyn ChatDirectory>),
        )
        .unwrap();

        let (sa, mut alice) = ws_pair(ROOMY).await;
        let (sb, mut bob) = ws_pair(ROOMY).await;
        hub.register(sa, "alice").await.unwrap();
        hub.register(sb, "bob").await.unwrap();

        let typing = Event::new(EventType::Typing).with_user("alice");
        hub.send_to_chat("c1", typing, "alice").await.unwrap();

        let got = next_event(&mut bob, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.event_type, EventType::Typing);
        assert_eq!(got.chat_id(), Some("c1"));
        assert!(next_event(&mut bob, Duration::from_millis(100)).await.is_none());
        assert!(next_event(&mut alice, Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn send_to_chat_reports_lookup_failures() {
        let without = hub();
        assert!(matches!(
            without
                .send_to_chat("c1", Event::new(EventType::Typing), "alice")
                .await,
            Err(HubError::NoDirectory)
        ));

        let directory: Arc<dyn ChatDirectory> = Arc::new(InMemoryDirectory::new());
        let with = Hub::new(HubConfig::default(), NoopHandler, Some(directory)).unwrap();
        let err = with
            .send_to_chat("missing", Event::new(EventType::Typing), "alice")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HubError::Directory(DirectoryError::ChatNotFound(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_unread_count_payload() {
        let hub = hub();
        let (server, mut client) = ws_pair(ROOMY).await;
        hub.register(server, "alice").await.unwrap();

        hub.broadcast_unread_count("alice", 7).await;

        let got = next_event(&mut client, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.event_type, EventType::UnreadCount);
        assert_eq!(got.user_id(), Some("alice"));
        let payload: Option<UnreadCountPayload> = got.parse_payload().unwrap();
        assert_eq!(payload, Some(UnreadCountPayload { count: 7 }));
    }

    #[test]
    fn encode_produces_text_frame() {
        let frame = encode(&Event::new(EventType::Connected)).unwrap();
        assert_eq!(frame, WsMessage::Text(r#"{"type":"connected"}"#.into()));
    }
}
