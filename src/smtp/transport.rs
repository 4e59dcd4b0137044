// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Line-oriented adapter over a duplex byte stream

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{error::Result, util};

/// Longest line accepted from a client, including the line terminator
///
/// Anything past this bound is discarded up to the next line feed; the
/// truncated head of the line is still delivered.
pub const MAX_LINE_LENGTH: usize = 1000;

/// Byte stream a session runs over, plain or encrypted
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub struct LineTransport<S> {
    stream: BufReader<S>,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        LineTransport {
            stream: BufReader::with_capacity(MAX_LINE_LENGTH * 4, stream),
        }
    }

    /// Read a single line, without its terminator
    ///
    /// Returns `None` once the peer has closed its side of the stream. An
    /// unterminated trailing line is still returned before that.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut overflow = false;
        let mut received = false;

        loop {
            let (done, used) = {
                let available = self.stream.fill_buf().await?;

                if available.is_empty() {
                    if !received {
                        return Ok(None);
                    }
                    (true, 0)
                } else {
                    received = true;

                    match memchr::memchr(b'\n', available) {
                        Some(inx) => {
                            append_bounded(&mut line, &available[..inx], &mut overflow);
                            (true, inx + 1)
                        }
                        None => {
                            append_bounded(&mut line, available, &mut overflow);
                            (false, available.len())
                        }
                    }
                }
            };

            self.stream.consume(used);

            if done {
                break;
            }
        }

        if line.ends_with(b"\r") {
            line.pop();
        }

        if overflow {
            log::debug!("line truncated to {} bytes: {:?}", line.len(), util::printable(&line));
        }

        log::trace!(">> {}", util::printable(&line));

        Ok(Some(line))
    }

    /// Write `data` as-is and flush it to the peer
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("<< {}", util::printable(data));
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the stream
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Has the client sent anything that hasn't been read as a line yet?
    pub fn has_pending_input(&self) -> bool {
        !self.stream.buffer().is_empty()
    }

    /// Give up the stream, dropping any buffered input
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

fn append_bounded(line: &mut Vec<u8>, data: &[u8], overflow: &mut bool) {
    // One byte of the bound is reserved for the line feed.
    let room = (MAX_LINE_LENGTH - 1).saturating_sub(line.len());

    if data.len() > room {
        *overflow = true;
    }

    line.extend_from_slice(&data[..data.len().min(room)]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn strips_terminators() {
        let mock = Builder::new()
            .read(b"EHLO example.com\r\nNOOP\nQU")
            .read(b"IT\r\n")
            .build();
        let mut transport = LineTransport::new(mock);

        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"EHLO example.com");
        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"NOOP");
        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"QUIT");
        assert!(transport.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keeps_empty_lines() {
        let mock = Builder::new().read(b"\r\n.\r\n").build();
        let mut transport = LineTransport::new(mock);

        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"");
        assert_eq!(transport.read_line().await.unwrap().unwrap(), b".");
        assert!(transport.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn returns_unterminated_tail() {
        let mock = Builder::new().read(b"NOOP\r\nQUIT").build();
        let mut transport = LineTransport::new(mock);

        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"NOOP");
        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"QUIT");
        assert!(transport.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncates_long_lines() {
        let mut input = vec![b'a'; 1500];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        let mock = Builder::new().read(&input).build();
        let mut transport = LineTransport::new(mock);

        let line = transport.read_line().await.unwrap().unwrap();
        assert_eq!(line.len(), MAX_LINE_LENGTH - 1);
        assert!(line.iter().all(|&c| c == b'a'));
        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn reports_buffered_input() {
        let mock = Builder::new().read(b"STARTTLS\r\nNOOP\r\n").build();
        let mut transport = LineTransport::new(mock);

        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"STARTTLS");
        assert!(transport.has_pending_input());
        assert_eq!(transport.read_line().await.unwrap().unwrap(), b"NOOP");
        assert!(!transport.has_pending_input());
    }

    #[tokio::test]
    async fn writes_raw_bytes() {
        let (client, server) = tokio::io::duplex(64);
        let mut transport = LineTransport::new(server);

        transport.write_bytes(b"220 ready\r\n").await.unwrap();
        transport.close().await.unwrap();
        drop(transport);

        let mut received = Vec::new();
        let mut client = client;
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"220 ready\r\n");
    }
}
