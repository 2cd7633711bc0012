//! A pair of in-process transports connected by channels, standing in for a
//! real wire in integration tests — the same "duplex" trick the teacher uses
//! for its in-process tests, minus the byte-level framing since this crate's
//! `Transport` trait already exchanges `Message` values directly.

use std::sync::Arc;

use async_trait::async_trait;
use mcp_protocol_core::model::Message;
use mcp_protocol_core::transport::{InboundMessage, SendOptions, Transport};
use tokio::sync::{mpsc, Mutex};

pub struct ChannelTransport {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Message, _options: SendOptions) -> Result<(), mcp_protocol_core::ServiceError> {
        self.tx
            .send(message)
            .await
            .map_err(|e| mcp_protocol_core::ServiceError::TransportSend(e.to_string()))
    }

    async fn receive(&self) -> Option<InboundMessage> {
        self.rx.lock().await.recv().await.map(InboundMessage::new)
    }

    async fn close(&self) {}
}

/// Build two ends of one logical connection: whatever side `a` sends, side
/// `b` receives, and vice versa.
pub fn pair() -> (Arc<ChannelTransport>, Arc<ChannelTransport>) {
    let (a_tx, b_rx) = mpsc::channel(64);
    let (b_tx, a_rx) = mpsc::channel(64);
    let a = Arc::new(ChannelTransport {
        tx: a_tx,
        rx: Mutex::new(a_rx),
    });
    let b = Arc::new(ChannelTransport {
        tx: b_tx,
        rx: Mutex::new(b_rx),
    });
    (a, b)
}
