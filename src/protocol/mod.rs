//! Protocol definitions for the command and notification channel
//!
//! Frames are JSON text: clients send [`CommandMessage`]s, the server
//! broadcasts [`ResponseMessage`]s and [`Notification`]s.

mod message;
mod notification;

pub use message::{CommandMessage, ResponseMessage, ResponseStatus};
pub use notification::{
    MetaType, Notification, NotificationSender, CLIENT_CONNECTED, CLIENT_DISCONNECTED,
    CLIENT_DROPPED, RECORDING_CREATED,
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The single WebSocket endpoint
pub const COMMAND_PATH: &str = "/api/v1/command";

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Maximum inbound frame size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Serialize a message to JSON text
pub fn serialize<T: Serialize>(msg: &T) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Deserialize a message from JSON text
pub fn deserialize<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        }));
    }
    serde_json::from_str(text).map_err(|e| {
        anyhow!(ProtocolError::MalformedMessage(format!(
            "Failed to deserialize: {}",
            e
        )))
    })
}
