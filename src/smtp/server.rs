// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! SMTP server

use std::{future::Future, net::SocketAddr};
use tokio::net::TcpListener;

use crate::error::{Error, Result};
use super::{connection::Connection, hooks::HookSet};

/// Accepts TCP connections and serves each on its own task
pub struct Server {
    listener: TcpListener,
    hooks: HookSet,
}

impl Server {
    pub async fn bind(addr: SocketAddr, hooks: HookSet) -> Result<Server> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        Ok(Server { listener, hooks })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients forever
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve clients until `shutdown` completes
    ///
    /// The listening socket is closed on shutdown. Connections which are
    /// already being served run to completion on their own.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        log::info!("Started SMTP server on {}", self.listener.local_addr()?);

        loop {
            let (socket, addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted?,
            };

            let hooks = self.hooks.clone();

            tokio::spawn(async move {
                if let Err(err) = Connection::new(socket, addr, hooks).handle().await {
                    log::error!("error serving {addr}: {err}");
                }
            });
        }

        log::info!("SMTP server on {} shut down", self.listener.local_addr()?);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::{AsyncBufReadExt, AsyncWriteExt, BufReader}, net::TcpStream, sync::oneshot};

    #[tokio::test]
    async fn serves_and_shuts_down() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), HookSet::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220 ") && line.ends_with(" ESMTP service ready\r\n"));

        client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("221 "));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn reports_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = Server::bind(addr, HookSet::default()).await.err().unwrap();
        assert!(matches!(err, Error::Bind { addr: a, .. } if a == addr));
    }
}
