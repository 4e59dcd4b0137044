// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

use async_trait::async_trait;
use smtp_hooks::{smtp::hooks::local_hostname, Authenticator, Delivery, Envelope, HookResult, Hooks};
use std::{collections::HashMap, sync::{Arc, atomic::{AtomicU64, Ordering}}};
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// In-memory mail store, also acting as the server's policy
pub struct Store {
    domain: String,
    users: HashMap<String, String>,
    messages: RwLock<Vec<Arc<Message>>>,
    sequence: AtomicU64,
}

pub struct Message {
    pub id: String,
    pub date: OffsetDateTime,
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}

impl Store {
    pub fn new(domain: Option<String>, users: HashMap<String, String>) -> Arc<Store> {
        Arc::new(Store {
            domain: domain.unwrap_or_else(local_hostname),
            users,
            messages: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    pub async fn messages(&self) -> impl std::ops::Deref<Target = Vec<Arc<Message>>> + '_ {
        self.messages.read().await
    }
}

impl Hooks for Store {
    fn server_domain(&self) -> String {
        self.domain.clone()
    }
}

#[async_trait]
impl Authenticator for Store {
    async fn plain_auth_received(&self, user: &str, password: &str) -> HookResult<bool> {
        Ok(self.users.get(user).map_or(false, |expected| expected == password))
    }
}

#[async_trait]
impl Delivery for Store {
    async fn deliver(&self, envelope: Envelope) -> HookResult<bool> {
        let date = OffsetDateTime::now_utc();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let message = Message {
            id: format!("{}.{}@{}", date.unix_timestamp(), sequence, self.domain),
            date,
            sender: envelope.sender,
            recipients: envelope.recipients,
            body: envelope.body,
        };

        log::info!("stored message {} from <{}> to {} ({} bytes, {})",
            message.id, message.sender, message.recipients.join(", "), message.body.len(),
            message.date);

        self.messages.write().await.push(Arc::new(message));

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<Store> {
        let users = [("alice".to_owned(), "wonderland".to_owned())].into_iter().collect();
        Store::new(Some("mx.example.org".into()), users)
    }

    #[tokio::test]
    async fn checks_passwords() {
        let store = store();
        assert!(store.has_users());
        assert!(store.plain_auth_received("alice", "wonderland").await.unwrap());
        assert!(!store.plain_auth_received("alice", "looking-glass").await.unwrap());
        assert!(!store.plain_auth_received("bob", "wonderland").await.unwrap());
    }

    #[tokio::test]
    async fn keeps_delivered_messages() {
        let store = store();
        let envelope = Envelope {
            sender: "foo@example.com".into(),
            recipients: vec!["bar@example.com".into()],
            body: b"Subject: test\r\n\r\nHello\r\n".to_vec(),
        };

        assert!(store.deliver(envelope.clone()).await.unwrap());
        assert!(store.deliver(envelope).await.unwrap());

        let messages = store.messages().await;
        assert_eq!(messages.len(), 2);
        assert_ne!(messages[0].id, messages[1].id);
        assert!(messages[0].id.ends_with("@mx.example.org"));
        assert_eq!(messages[1].recipients, ["bar@example.com"]);
        assert_eq!(store.server_domain(), "mx.example.org");
    }
}
