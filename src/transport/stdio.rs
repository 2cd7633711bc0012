//! Standard I/O transport: newline-delimited JSON over any `AsyncRead` /
//! `AsyncWrite` pair, typically process stdin/stdout (SPEC_FULL §4.1).
//!
//! There is no session id and no `relatedRequestId` routing — every frame
//! goes over the same pipe in both directions, so [`SendOptions`] beyond the
//! message itself is ignored.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::ServiceError;
use crate::model::Message;
use crate::transport::{InboundMessage, SendOptions, Transport};

/// Newline-delimited JSON transport over arbitrary async I/O.
pub struct StdioTransport {
    writer: Mutex<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl StdioTransport {
    /// `reader`/`writer` are boxed so the same type can wrap real stdio or,
    /// in tests, an in-memory duplex pipe.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (tx, inbound_rx) = mpsc::channel(64);
        let mut lines = FramedRead::new(Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>, LinesCodec::new());
        let reader_task = tokio::spawn(async move {
            loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Message>(&line) {
                            Ok(message) => {
                                if tx.send(InboundMessage::new(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("failed to parse stdio frame: {e}");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("stdio read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        });
        Self {
            writer: Mutex::new(FramedWrite::new(
                Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
                LinesCodec::new(),
            )),
            inbound_rx: Mutex::new(inbound_rx),
            reader_task,
        }
    }

    /// Standard in / standard out.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: Message, _options: SendOptions) -> Result<(), ServiceError> {
        let line =
            serde_json::to_string(&message).map_err(|e| ServiceError::TransportSend(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer
            .send(line)
            .await
            .map_err(|e| ServiceError::TransportSend(e.to_string()))
    }

    async fn receive(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.reader_task.abort();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestId;

    #[tokio::test]
    async fn round_trips_a_line_delimited_frame() {
        let (client_r, server_w) = tokio::io::duplex(4096);
        let (server_r, client_w) = tokio::io::duplex(4096);
        let server = StdioTransport::new(server_r, server_w);
        let client = StdioTransport::new(client_r, client_w);

        client
            .send(
                Message::request(RequestId::Number(1), "ping", None),
                SendOptions::default(),
            )
            .await
            .unwrap();

        let inbound = server.receive().await.unwrap();
        assert_eq!(inbound.message.method(), Some("ping"));
    }
}
