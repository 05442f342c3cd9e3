//! Command channel - dispatches inbound WebSocket messages to named commands
//! and broadcasts their responses

mod builtins;

pub use builtins::builtin_commands;

use crate::error::{Error, Result};
use crate::protocol::{deserialize, CommandMessage, ResponseMessage, ResponseStatus};
use crate::server::MessagingServer;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A named operation invocable over the command channel
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool {
        true
    }

    /// Check arguments before execution. The error is reported to the
    /// client verbatim.
    fn validate(&self, args: &[String]) -> std::result::Result<(), String>;

    async fn execute(&self, args: &[String], registry: &CommandRegistry) -> Result<Value>;
}

/// Commands by unique name
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Arc<dyn Command>>,
}

impl CommandRegistry {
    /// Fails if two commands share a name
    pub fn new(commands: Vec<Arc<dyn Command>>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for command in commands {
            let name = command.name();
            if map.insert(name, command).is_some() {
                return Err(Error::Internal(format!(
                    "\"{}\" command defined more than once",
                    name
                )));
            }
        }
        Ok(Self { commands: map })
    }

    pub fn registered_command_names(&self) -> Vec<&'static str> {
        self.commands.keys().copied().collect()
    }

    /// Sorted names of the commands currently available
    pub fn available_command_names(&self) -> Vec<&'static str> {
        self.commands
            .values()
            .filter(|c| c.is_available())
            .map(|c| c.name())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(name)
    }
}

/// Drains the server's inbound queue one message at a time
pub struct CommandExecutor {
    server: Arc<MessagingServer>,
    registry: Arc<CommandRegistry>,
}

impl CommandExecutor {
    pub fn new(server: Arc<MessagingServer>, registry: Arc<CommandRegistry>) -> Self {
        Self { server, registry }
    }

    /// Process messages until the server shuts down
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = self.server.read_message().await {
                tracing::debug!(
                    "Command message from {}: {}",
                    message.remote_address,
                    message.text
                );
                let response = self.handle(&message.text).await;
                self.server.write_message(&response);
            }
            tracing::info!("Command executor finished");
        })
    }

    /// Parse, validate and execute one message
    pub async fn handle(&self, text: &str) -> ResponseMessage {
        let message: CommandMessage = match deserialize(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Malformed command message: {}", e);
                return ResponseMessage::new(
                    None,
                    ResponseStatus::MalformedMessage,
                    "",
                    Value::String(e.to_string()),
                );
            }
        };
        let CommandMessage { id, command, args } = message;

        let handler = match self.registry.get(&command) {
            Some(handler) if handler.is_available() => handler,
            Some(_) => {
                return ResponseMessage::new(
                    id,
                    ResponseStatus::InvalidCommand,
                    command.clone(),
                    Value::String(format!("Command \"{}\" not available", command)),
                )
            }
            None => {
                return ResponseMessage::new(
                    id,
                    ResponseStatus::InvalidCommand,
                    command.clone(),
                    Value::String(format!("Command \"{}\" not recognized", command)),
                )
            }
        };

        if let Err(reason) = handler.validate(&args) {
            return ResponseMessage::new(
                id,
                ResponseStatus::InvalidCommand,
                command,
                Value::String(reason),
            );
        }

        match handler.execute(&args, &self.registry).await {
            Ok(payload) => ResponseMessage::new(id, ResponseStatus::Ok, command, payload),
            Err(e) => {
                tracing::warn!("Command {} failed: {}", command, e);
                let status = match e {
                    Error::AuthenticationFailure(_) => ResponseStatus::TargetAuthFailure,
                    _ => ResponseStatus::CommandException,
                };
                ResponseMessage::new(id, status, command, Value::String(e.to_string()))
            }
        }
    }
}
