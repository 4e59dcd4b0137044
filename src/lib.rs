// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Embeddable SMTP server
//!
//! The protocol engine accepts connections, drives the SMTP dialogue and
//! leaves every policy decision to [`Hooks`] supplied by the application.
//!
//! ```no_run
//! use std::sync::Arc;
//! use smtp_hooks::{DefaultHooks, HookSet, Server};
//!
//! # async fn run() -> smtp_hooks::Result<()> {
//! let hooks = HookSet::new(Arc::new(DefaultHooks)).with_max_message_size(10 << 20);
//! Server::bind("[::]:2525".parse().unwrap(), hooks).await?.run().await
//! # }
//! ```

pub mod error;
pub mod smtp;
mod util;

pub use error::{Error, Result};
pub use smtp::{
    connection::Connection,
    hooks::{Authenticator, Capabilities, DefaultHooks, Delivery, HookResult, HookSet, Hooks, StartTls},
    proto::{Action, Response, Session},
    reply::{format_reply, Reply},
    server::Server,
    session::{Envelope, State, Transaction},
    transport::{Io, LineTransport, MAX_LINE_LENGTH},
};
