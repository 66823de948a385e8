//! Transport abstractions for the node runtime.

use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use carnelia_wire::Message;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Abstract transport carrying whole messages.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Receive the next inbound message. `Ok(None)` once input is exhausted.
    async fn recv(&self) -> Result<Option<Message>>;

    /// Send a message.
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Newline-delimited JSON over an async reader/writer pair.
pub struct LineTransport<R, W> {
    lines: Mutex<Lines<R>>,
    writer: Mutex<W>,
}

/// The transport Maelstrom talks to: stdin in, stdout out.
pub type StdioTransport = LineTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        LineTransport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.lines.into_inner().into_inner(), self.writer.into_inner())
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&self) -> Result<Option<Message>> {
        let mut lines = self.lines.lock().await;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match Message::from_line(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!(error = %e, %line, "skipping undecodable input line"),
            }
        }
        Ok(None)
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let mut line = message.to_line()?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// In-memory transport for testing.
pub struct MemoryTransport {
    inbound: Mutex<mpsc::Receiver<Message>>,
    outbound: mpsc::Sender<Message>,
}

/// The far end of a [`MemoryTransport`].
pub struct MemoryHandle {
    inbound: mpsc::Sender<Message>,
    outbound: mpsc::Receiver<Message>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> (Self, MemoryHandle) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
            },
            MemoryHandle {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn recv(&self) -> Result<Option<Message>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.outbound
            .send(message.clone())
            .await
            .map_err(|_| RuntimeError::Closed)
    }
}

impl MemoryHandle {
    /// Deliver a message to the node.
    pub async fn inject(&self, message: Message) -> Result<()> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| RuntimeError::Closed)
    }

    /// Next message the node sent.
    pub async fn next(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    /// Signal end of input and keep reading what the node sends.
    pub fn close_input(self) -> mpsc::Receiver<Message> {
        self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carnelia_wire::Body;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_line_transport_skips_bad_lines() {
        let input = concat!(
            "\n",
            "garbage\n",
            r#"{"src":"c1","dest":"n1","body":{"type":"echo","msg_id":1,"echo":"hi"}}"#,
            "\n"
        );
        let transport = LineTransport::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());

        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg.kind(), "echo");
        assert!(transport.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_transport_writes_one_line_per_message() {
        let transport = LineTransport::new(Cursor::new(Vec::new()), Vec::new());
        transport
            .send(&Message::new("n1", "c1", Body::new("echo_ok").in_reply_to(1)))
            .await
            .unwrap();
        transport
            .send(&Message::new("n1", "c2", Body::new("echo_ok").in_reply_to(2)))
            .await
            .unwrap();

        let (_, written) = transport.into_parts();
        let text = String::from_utf8(written).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(Message::from_line(lines[1]).unwrap().dest.as_str(), "c2");
    }

    #[tokio::test]
    async fn test_memory_transport() {
        let (transport, mut handle) = MemoryTransport::new(8);

        handle
            .inject(Message::new("c1", "n1", Body::new("read")))
            .await
            .unwrap();
        let inbound = transport.recv().await.unwrap().unwrap();
        assert_eq!(inbound.kind(), "read");

        transport
            .send(&Message::new("n1", "c1", Body::new("read_ok")))
            .await
            .unwrap();
        assert_eq!(handle.next().await.unwrap().kind(), "read_ok");

        drop(handle.close_input());
        assert!(transport.recv().await.unwrap().is_none());
    }
}
