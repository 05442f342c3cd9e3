//! Message types exchanged over the command channel

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent by a client over the WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    /// Client-chosen correlation id, echoed in the response
    #[serde(default)]
    pub id: Option<String>,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Outcome class of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    InvalidCommand,
    CommandException,
    MalformedMessage,
    TargetAuthFailure,
}

impl ResponseStatus {
    pub fn code(&self) -> i32 {
        match self {
            ResponseStatus::Ok => 0,
            ResponseStatus::InvalidCommand => -1,
            ResponseStatus::CommandException => -2,
            ResponseStatus::MalformedMessage => -3,
            ResponseStatus::TargetAuthFailure => -4,
        }
    }
}

/// Response broadcast after a command has been processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub id: Option<String>,
    pub status: i32,
    pub command_name: String,
    pub payload: Value,
}

impl ResponseMessage {
    pub fn new(
        id: Option<String>,
        status: ResponseStatus,
        command_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id,
            status: status.code(),
            command_name: command_name.into(),
            payload,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok.code()
    }
}
