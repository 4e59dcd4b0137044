// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Request/response pump for a single client connection

use std::net::SocketAddr;

use crate::error::{Error, Result};
use super::{
    hooks::HookSet,
    proto::{Action, Session},
    transport::{Io, LineTransport},
};

pub struct Connection {
    transport: LineTransport<Box<dyn Io>>,
    session: Session,
    peer: SocketAddr,
}

impl Connection {
    pub fn new<S: Io + 'static>(stream: S, peer: SocketAddr, hooks: HookSet) -> Self {
        Connection {
            transport: LineTransport::new(Box::new(stream)),
            session: Session::new(hooks, peer.ip()),
            peer,
        }
    }

    /// Serve the client until it quits or disconnects
    ///
    /// The stream is shut down on every exit path.
    pub async fn handle(self) -> Result<()> {
        let peer = self.peer;
        log::debug!("connection from {peer}");

        let result = self.run().await;

        log::debug!("connection from {peer} closed");
        result
    }

    async fn run(mut self) -> Result<()> {
        let mut result = self.greet().await;

        while let Ok(Action::StartTls) = result {
            self = self.start_tls().await?;
            result = self.serve().await;
        }

        self.close().await;
        result.map(drop)
    }

    async fn greet(&mut self) -> Result<Action> {
        let response = self.session.start_session().await;
        self.transport.write_bytes(response.data).await?;

        match response.action {
            Action::Close => Ok(Action::Close),
            _ => self.serve().await,
        }
    }

    /// Exchange lines until the client leaves or asks for TLS
    async fn serve(&mut self) -> Result<Action> {
        loop {
            let line = match self.transport.read_line().await? {
                Some(line) => line,
                None => {
                    log::debug!("{} disconnected", self.peer);
                    return Ok(Action::Close);
                }
            };

            let response = self.session.process_line(&line).await;
            let action = response.action;

            if !response.data.is_empty() {
                self.transport.write_bytes(response.data).await?;
            }

            if action != Action::Continue {
                return Ok(action);
            }
        }
    }

    /// Hand the stream to the TLS hook and continue over what it returns
    ///
    /// When the hook fails the stream is gone with it, which closes the
    /// connection.
    async fn start_tls(mut self) -> Result<Self> {
        // Plain text sent ahead of the handshake must not reach the
        // encrypted session.
        if self.transport.has_pending_input() {
            log::warn!("{} sent commands before TLS negotiation", self.peer);
            self.close().await;
            return Err(Error::DataBeforeTls);
        }

        let Connection { transport, mut session, peer } = self;

        let stream = session.start_tls(transport.into_inner()).await.map_err(Error::StartTls)?;
        log::debug!("TLS negotiated with {peer}");

        Ok(Connection {
            transport: LineTransport::new(stream),
            session,
            peer,
        })
    }

    async fn close(&mut self) {
        if let Err(err) = self.transport.close().await {
            log::debug!("could not shut down connection to {}: {err}", self.peer);
        }
    }
}
