// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Per-connection protocol state

/// Markers describing where a session is in the protocol
///
/// These are independent: a client may well have negotiated TLS,
/// authenticated and given a sender all at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct State {
    /// HELO or EHLO accepted
    pub ehlo: bool,
    /// TLS negotiated with STARTTLS
    pub starttls: bool,
    /// Client authenticated
    pub auth: bool,
    /// Waiting for the initial response of AUTH PLAIN
    pub auth_plain_incomplete: bool,
    /// Waiting for the user name or password of AUTH LOGIN
    pub auth_login_incomplete: bool,
    pub mail_from: bool,
    pub rcpt: bool,
    /// Receiving message content
    pub data: bool,
    pub quit: bool,
}

impl State {
    /// Forget everything but the client's identity and negotiated TLS
    pub fn reset(&mut self) {
        *self = State {
            ehlo: self.ehlo,
            starttls: self.starttls,
            ..State::default()
        };
    }

    /// Close the current mail transaction
    pub fn end_transaction(&mut self) {
        self.mail_from = false;
        self.rcpt = false;
        self.data = false;
    }
}

/// Mail transaction in progress
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    /// Reverse path, empty for the null sender
    pub sender: String,
    pub recipients: Vec<String>,
    /// Collected content, kept only when a delivery hook is attached
    pub body: Vec<u8>,
    /// Content size on the wire so far, dot-stuffing excluded
    pub size: usize,
    /// First failure reported by the content hook
    pub failure: Option<String>,
}

impl Transaction {
    pub fn new(sender: String) -> Self {
        Transaction {
            sender,
            ..Transaction::default()
        }
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope {
            sender: self.sender,
            recipients: self.recipients,
            body: self.body,
        }
    }
}

/// A complete message as handed to a [`Delivery`](super::hooks::Delivery)
/// hook
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    /// Message content with CRLF line endings and dot-stuffing removed
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_identity_and_tls() {
        let mut state = State {
            ehlo: true,
            starttls: true,
            auth: true,
            mail_from: true,
            rcpt: true,
            ..State::default()
        };

        state.reset();

        assert_eq!(state, State { ehlo: true, starttls: true, ..State::default() });
    }

    #[test]
    fn end_of_transaction_keeps_session() {
        let mut state = State {
            ehlo: true,
            auth: true,
            mail_from: true,
            rcpt: true,
            data: true,
            ..State::default()
        };

        state.end_transaction();

        assert_eq!(state, State { ehlo: true, auth: true, ..State::default() });
    }
}
