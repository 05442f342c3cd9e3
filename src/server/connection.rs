//! Client connection handling

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Outbound frames buffered per client before the client counts as stalled
pub const CLIENT_BUFFER: usize = 256;

/// An admitted WebSocket client
pub struct WsClient {
    id: Uuid,

    remote_address: String,

    /// Frames for the writer task
    sender: mpsc::Sender<Message>,

    /// The client's read loop
    reader: JoinHandle<()>,
}

impl WsClient {
    pub fn new(
        id: Uuid,
        remote_address: String,
        sender: mpsc::Sender<Message>,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            remote_address,
            sender,
            reader,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Queue a text frame without waiting on the transport
    pub fn send_text(&self, text: String) {
        match self.sender.try_send(Message::Text(text)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Dropping message for slow client {} ({})",
                    self.remote_address,
                    self.id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Client {} writer already closed", self.id);
            }
        }
    }

    /// Queue a close frame. The writer task finishes after sending it.
    pub fn close(&self, code: u16, reason: String) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if self.sender.try_send(Message::Close(Some(frame))).is_err() {
            tracing::debug!("Could not queue close frame for client {}", self.id);
        }
    }

    /// Stop the read loop
    pub fn cancel_reader(&self) {
        self.reader.abort();
    }
}

/// Task to write outgoing frames to the client
pub async fn client_writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<Message>,
) {
    while let Some(msg) = receiver.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            tracing::debug!("Failed to write message to client: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;

    tracing::debug!("Client writer task finished");
}

/// Next text frame from the client, `None` once the connection is closed
pub async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Error reading from client: {}", e);
                return None;
            }
        }
    }
    None
}
