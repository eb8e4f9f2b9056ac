//! Chat membership and read receipts, owned by the data layer.
//!
//! The hub does not know who is in a chat. [`Hub::send_to_chat`] asks a
//! [`ChatDirectory`] on every call; nothing is cached, so a member added
//! or removed in the store is seen by the next call. The staleness window
//! is the time between the membership read and the last enqueue of that
//! call.
//!
//! [`Hub::send_to_chat`]: crate::Hub::send_to_chat

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use crate::types::UserId;

/// A boxed future returned by directory methods.
pub type DirectoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DirectoryError>> + Send + 'a>>;

/// Errors reported by a chat directory.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("user {user_id} is not a member of chat {chat_id}")]
    NotMember { chat_id: String, user_id: UserId },

    #[error("directory backend error: {0}")]
    Backend(String),
}

/// Membership lookups and read-receipt writes backed by durable storage.
pub trait ChatDirectory: Send + Sync + 'static {
    /// Returns every participant of a chat.
    fn chat_members<'a>(&'a self, chat_id: &'a str) -> DirectoryFuture<'a, Vec<UserId>>;

    /// Marks a message as read by `reader`.
    fn mark_read<'a>(
        &'a self,
        chat_id: &'a str,
        message_id: &'a str,
        reader: &'a str,
    ) -> DirectoryFuture<'a, ()>;
}

#[derive(Debug, Default)]
struct ChatRecord {
    members: Vec<UserId>,
    /// (message id, reader) pairs.
    read: HashSet<(String, UserId)>,
}

/// In-process directory for tests and single-node demos.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    chats: RwLock<HashMap<String, ChatRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a chat with the given participants.
    pub async fn upsert_chat<I, U>(&self, chat_id: impl Into<String>, members: I)
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        let members = members.into_iter().map(Into::into).collect();
        let mut chats = self.chats.write().await;
        let record = chats.entry(chat_id.into()).or_default();
        record.members = members;
    }

    /// Deletes a chat and its read receipts.
    pub async fn remove_chat(&self, chat_id: &str) -> bool {
        self.chats.write().await.remove(chat_id).is_some()
    }

    /// Returns `true` if `reader` has marked the message as read.
    pub async fn is_read(&self, chat_id: &str, message_id: &str, reader: &str) -> bool {
        self.chats.read().await.get(chat_id).is_some_and(|record| {
            record
                .read
                .contains(&(message_id.to_owned(), reader.to_owned()))
        })
    }
}

impl ChatDirectory for InMemoryDirectory {
    fn chat_members<'a>(&'a self, chat_id: &'a str) -> DirectoryFuture<'a, Vec<UserId>> {
        Box::pin(async move {
            self.chats
                .read()
                .await
                .get(chat_id)
                .map(|record| record.members.clone())
                .ok_or_else(|| DirectoryError::ChatNotFound(chat_id.to_owned()))
        })
    }

    fn mark_read<'a>(
        &'a self,
        chat_id: &'a str,
        message_id: &'a str,
        reader: &'a str,
    ) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            let mut chats = self.chats.write().await;
            let record = chats
                .get_mut(chat_id)
                .ok_or_else(|| DirectoryError::ChatNotFound(chat_id.to_owned()))?;
            if !record.members.iter().any(|m| m == reader) {
                return Err(DirectoryError::NotMember {
                    chat_id: chat_id.to_owned(),
                    user_id: reader.to_owned(),
                });
            }
            record
                .read
                .insert((message_id.to_owned(), reader.to_owned()));
            Ok(())
        })
    }
}
