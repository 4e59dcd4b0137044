// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

use std::{io, net::SocketAddr};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Faults which end a connection or prevent the server from running
///
/// Protocol-level problems (bad syntax, bad sequence, rejected policy) are
/// never reported through this type; they are answered on the wire and the
/// session carries on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("could not bind TCP socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("TLS negotiation failed: {0:#}")]
    StartTls(anyhow::Error),
    #[error("client sent data ahead of TLS negotiation")]
    DataBeforeTls,
}
