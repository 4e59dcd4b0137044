// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Policy hooks supplied by the embedding application
//!
//! Every hook in [`Hooks`] has a permissive default. The optional
//! extensions ([`Authenticator`], [`StartTls`], [`Delivery`] and the
//! message size limit) are attached to a [`HookSet`]; attaching one is what
//! makes the server advertise and accept the corresponding commands.

use async_trait::async_trait;
use std::{future::Future, net::IpAddr, sync::Arc};

use super::{session::Envelope, transport::Io};

/// Outcome of a hook; an `Err` is reported to the client and never ends the
/// session
pub type HookResult<T> = anyhow::Result<T>;

#[async_trait]
pub trait Hooks: Send + Sync {
    /// Accept or reject a freshly connected client. Rejected clients are
    /// answered with 554 and disconnected.
    async fn client_connection(&self, _peer: IpAddr) -> HookResult<bool> {
        Ok(true)
    }

    /// Domain announced in the greeting and in HELO, EHLO and QUIT replies
    fn server_domain(&self) -> String {
        local_hostname()
    }

    /// Domain given by the client in HELO or EHLO
    async fn ehlo_domain_received(&self, _domain: &str) -> HookResult<bool> {
        Ok(true)
    }

    /// Envelope sender, with angle brackets removed. The null sender is
    /// passed as an empty string.
    async fn sender_received(&self, _address: &str) -> HookResult<bool> {
        Ok(true)
    }

    async fn recipient_received(&self, _address: &str) -> HookResult<bool> {
        Ok(true)
    }

    /// DATA was accepted; called once before any content line
    async fn data_command_received(&self) -> HookResult<()> {
        Ok(())
    }

    /// One line of message content, terminator removed and leading dot
    /// unescaped
    async fn data_line_received(&self, _line: &[u8]) -> HookResult<()> {
        Ok(())
    }

    /// End of message content. Return `false` to reject the message.
    async fn message_received(&self) -> HookResult<bool> {
        Ok(true)
    }
}

/// Hooks with all default behaviour
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

/// Credential check for AUTH PLAIN and AUTH LOGIN
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn plain_auth_received(&self, user: &str, password: &str) -> HookResult<bool>;
}

/// TLS negotiation following a STARTTLS command
///
/// Called after the 220 reply has been flushed to the client, with the
/// plain stream. The returned stream carries the rest of the session.
#[async_trait]
pub trait StartTls: Send + Sync {
    async fn start_tls(&self, peer: IpAddr, stream: Box<dyn Io>) -> HookResult<Box<dyn Io>>;
}

/// Receives each complete message once its content has been accepted by
/// [`Hooks::message_received`]
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> HookResult<bool>;
}

#[async_trait]
impl<F, Fut> Delivery for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HookResult<bool>> + Send + 'static,
{
    async fn deliver(&self, envelope: Envelope) -> HookResult<bool> {
        self(envelope).await
    }
}

/// Extensions enabled for a [`HookSet`], fixed when it is built
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub starttls: bool,
    pub auth: bool,
    pub max_message_size: Option<usize>,
}

impl Capabilities {
    /// Keywords following the domain line of an EHLO reply
    pub fn ehlo_keywords(&self) -> Vec<String> {
        let mut keywords = Vec::new();

        if self.starttls {
            keywords.push("STARTTLS".to_owned());
        }
        if self.auth {
            keywords.push("AUTH PLAIN LOGIN".to_owned());
        }
        if let Some(size) = self.max_message_size {
            keywords.push(format!("SIZE {size}"));
        }

        keywords.push("PIPELINING".to_owned());
        keywords.push("8BITMIME".to_owned());
        keywords
    }

    /// Commands listed in a HELP reply
    pub fn commands(&self) -> Vec<&'static str> {
        let mut commands = vec!["HELO", "EHLO"];

        if self.starttls {
            commands.push("STARTTLS");
        }
        if self.auth {
            commands.push("AUTH");
        }

        commands.extend(["MAIL", "RCPT", "DATA", "NOOP", "QUIT", "RSET", "HELP"]);
        commands
    }
}

/// Hooks together with their optional extensions, shared by all sessions
/// of one server
#[derive(Clone)]
pub struct HookSet {
    hooks: Arc<dyn Hooks>,
    auth: Option<Arc<dyn Authenticator>>,
    tls: Option<Arc<dyn StartTls>>,
    delivery: Option<Arc<dyn Delivery>>,
    max_message_size: Option<usize>,
    domain: Arc<str>,
}

impl HookSet {
    pub fn new<H: Hooks + 'static>(hooks: Arc<H>) -> Self {
        let domain = hooks.server_domain().into();
        HookSet {
            hooks,
            auth: None,
            tls: None,
            delivery: None,
            max_message_size: None,
            domain,
        }
    }

    /// Advertise and accept AUTH PLAIN and AUTH LOGIN
    pub fn with_auth<A: Authenticator + 'static>(mut self, auth: Arc<A>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Advertise and accept STARTTLS
    pub fn with_starttls<T: StartTls + 'static>(mut self, tls: Arc<T>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Collect content of each transaction and hand it over as an
    /// [`Envelope`]
    pub fn with_delivery<D: Delivery + 'static>(mut self, delivery: Arc<D>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Advertise SIZE and refuse messages larger than `size` bytes
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            starttls: self.tls.is_some(),
            auth: self.auth.is_some(),
            max_message_size: self.max_message_size,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn hooks(&self) -> &dyn Hooks {
        &*self.hooks
    }

    pub fn authenticator(&self) -> Option<&dyn Authenticator> {
        self.auth.as_deref()
    }

    pub fn tls(&self) -> Option<&dyn StartTls> {
        self.tls.as_deref()
    }

    pub fn delivery(&self) -> Option<&dyn Delivery> {
        self.delivery.as_deref()
    }
}

impl Default for HookSet {
    fn default() -> Self {
        HookSet::new(Arc::new(DefaultHooks))
    }
}

/// Name of this host, or `localhost` when it can't be determined
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named;

    impl Hooks for Named {
        fn server_domain(&self) -> String {
            "mx.example.org".into()
        }
    }

    struct AllowAll;

    #[async_trait]
    impl Authenticator for AllowAll {
        async fn plain_auth_received(&self, _: &str, _: &str) -> HookResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn domain_is_resolved_once() {
        let hooks = HookSet::new(Arc::new(Named));
        assert_eq!(hooks.domain(), "mx.example.org");
    }

    #[test]
    fn capabilities_follow_attached_extensions() {
        let hooks = HookSet::default();
        assert_eq!(hooks.capabilities(), Capabilities::default());
        assert_eq!(hooks.capabilities().ehlo_keywords(), ["PIPELINING", "8BITMIME"]);
        assert_eq!(hooks.capabilities().commands().join(" "),
            "HELO EHLO MAIL RCPT DATA NOOP QUIT RSET HELP");

        let hooks = hooks.with_auth(Arc::new(AllowAll)).with_max_message_size(1024);
        let caps = hooks.capabilities();
        assert!(caps.auth);
        assert!(!caps.starttls);
        assert_eq!(caps.ehlo_keywords(), ["AUTH PLAIN LOGIN", "SIZE 1024", "PIPELINING", "8BITMIME"]);
        assert_eq!(caps.commands().join(" "),
            "HELO EHLO AUTH MAIL RCPT DATA NOOP QUIT RSET HELP");
    }
}
