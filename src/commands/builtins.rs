//! Built-in commands

use super::{Command, CommandRegistry};
use crate::agent::{OptionKey, RecordingOptions, TargetId};
use crate::error::{Error, Result};
use crate::recordings::{parse_event_specifier, RecordingOrchestrator};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Every built-in command bound to `recordings`
pub fn builtin_commands(recordings: Arc<RecordingOrchestrator>) -> Vec<Arc<dyn Command>> {
    vec![
        Arc::new(HelpCommand),
        Arc::new(ListCommand(Arc::clone(&recordings))),
        Arc::new(DumpCommand(Arc::clone(&recordings))),
        Arc::new(StartCommand(Arc::clone(&recordings))),
        Arc::new(SaveCommand(Arc::clone(&recordings))),
        Arc::new(DeleteCommand(Arc::clone(&recordings))),
        Arc::new(ListSavedCommand(Arc::clone(&recordings))),
        Arc::new(DeleteSavedCommand(Arc::clone(&recordings))),
        Arc::new(RecordingOptionCommand(Arc::clone(&recordings))),
        Arc::new(DisconnectCommand(recordings)),
    ]
}

fn expect_args(args: &[String], count: usize, usage: &str) -> std::result::Result<(), String> {
    if args.len() != count {
        return Err(usage.to_string());
    }
    Ok(())
}

fn validate_target(target: &str) -> std::result::Result<(), String> {
    if target.trim().is_empty() || target.chars().any(char::is_whitespace) {
        return Err(format!("{} is an invalid connection specifier", target));
    }
    Ok(())
}

fn validate_recording_name(name: &str) -> std::result::Result<(), String> {
    RecordingOptions::builder(name)
        .build()
        .map(|_| ())
        .map_err(|_| format!("{} is an invalid recording name", name))
}

fn validate_events(events: &str) -> std::result::Result<(), String> {
    parse_event_specifier(events)
        .map(|_| ())
        .map_err(|_| format!("{} is an invalid events specifier", events))
}

/// Run every check and report all failures together
fn collect(checks: Vec<std::result::Result<(), String>>) -> std::result::Result<(), String> {
    let failures: Vec<String> = checks.into_iter().filter_map(|c| c.err()).collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    fn name(&self) -> &'static str {
        "help"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 0, "No arguments expected")
    }

    async fn execute(&self, _args: &[String], registry: &CommandRegistry) -> Result<Value> {
        Ok(json!(registry.available_command_names()))
    }
}

struct ListCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for ListCommand {
    fn name(&self) -> &'static str {
        "list"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 1, "Expected one argument: target")?;
        validate_target(&args[0])
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        let recordings = self.0.list(&TargetId::from(args[0].as_str())).await?;
        Ok(serde_json::to_value(recordings)?)
    }
}

fn validate_dump_args(args: &[String]) -> std::result::Result<(), String> {
    expect_args(
        args,
        4,
        "Expected four arguments: target, recording name, recording length, and event specifier",
    )?;
    let seconds = &args[2];
    let duration = if !seconds.is_empty() && seconds.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(format!("{} is an invalid recording length", seconds))
    };
    collect(vec![
        validate_target(&args[0]),
        validate_recording_name(&args[1]),
        duration,
        validate_events(&args[3]),
    ])
}

/// Fixed-duration recording
struct DumpCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for DumpCommand {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        validate_dump_args(args)
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        let seconds: u64 = args[2].parse().map_err(|_| {
            Error::InvalidOptions(format!("{} is an invalid recording length", args[2]))
        })?;
        let options = self
            .0
            .build_options(RecordingOptions::builder(args[1].as_str()).duration(seconds))?;
        let (template, template_type) = parse_event_specifier(&args[3])?;
        let descriptor = self
            .0
            .start(
                &TargetId::from(args[0].as_str()),
                options,
                &template,
                template_type,
            )
            .await?;
        Ok(serde_json::to_value(descriptor)?)
    }
}

/// Continuous recording
struct StartCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for StartCommand {
    fn name(&self) -> &'static str {
        "start"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(
            args,
            3,
            "Expected three arguments: target, recording name, and event specifier",
        )?;
        collect(vec![
            validate_target(&args[0]),
            validate_recording_name(&args[1]),
            validate_events(&args[2]),
        ])
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        let options = self
            .0
            .build_options(RecordingOptions::builder(args[1].as_str()))?;
        let (template, template_type) = parse_event_specifier(&args[2])?;
        let descriptor = self
            .0
            .start(
                &TargetId::from(args[0].as_str()),
                options,
                &template,
                template_type,
            )
            .await?;
        Ok(serde_json::to_value(descriptor)?)
    }
}

struct SaveCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for SaveCommand {
    fn name(&self) -> &'static str {
        "save"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 2, "Expected two arguments: target and recording name")?;
        collect(vec![validate_target(&args[0]), validate_recording_name(&args[1])])
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        let file_name = self
            .0
            .save(&TargetId::from(args[0].as_str()), &args[1])
            .await?;
        Ok(Value::String(file_name))
    }
}

struct DeleteCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for DeleteCommand {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 2, "Expected two arguments: target and recording name")?;
        collect(vec![validate_target(&args[0]), validate_recording_name(&args[1])])
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        self.0
            .delete(&TargetId::from(args[0].as_str()), &args[1])
            .await?;
        Ok(Value::Null)
    }
}

struct ListSavedCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for ListSavedCommand {
    fn name(&self) -> &'static str {
        "list-saved"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 0, "No arguments expected")
    }

    async fn execute(&self, _args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        Ok(json!(self.0.list_archived().await?))
    }
}

struct DeleteSavedCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for DeleteSavedCommand {
    fn name(&self) -> &'static str {
        "delete-saved"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 1, "Expected one argument: saved recording name")
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        self.0.delete_archived(&args[0]).await?;
        Ok(Value::Null)
    }
}

/// `key=value` sets an override, `-key` clears it
struct RecordingOptionCommand(Arc<RecordingOrchestrator>);

enum OptionChange {
    Set(OptionKey, String),
    Unset(OptionKey),
}

impl RecordingOptionCommand {
    fn parse(arg: &str) -> std::result::Result<OptionChange, String> {
        if let Some(key) = arg.strip_prefix('-') {
            let key: OptionKey = key.parse().map_err(|e: Error| e.to_string())?;
            return Ok(OptionChange::Unset(key));
        }
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => (key, value),
            _ => return Err(format!("{} is an invalid option string", arg)),
        };
        let key: OptionKey = key.parse().map_err(|e: Error| e.to_string())?;
        Ok(OptionChange::Set(key, value.to_string()))
    }
}

#[async_trait]
impl Command for RecordingOptionCommand {
    fn name(&self) -> &'static str {
        "recording-option"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 1, "Expected one argument: recording option name")?;
        Self::parse(&args[0]).map(|_| ())
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        let change = Self::parse(&args[0]).map_err(Error::InvalidOptions)?;
        let customizer = self.0.customizer();
        match change {
            OptionChange::Set(key, value) => customizer.set(key, value)?,
            OptionChange::Unset(key) => customizer.unset(key),
        }
        Ok(Value::Null)
    }
}

/// Close a target's cached session
struct DisconnectCommand(Arc<RecordingOrchestrator>);

#[async_trait]
impl Command for DisconnectCommand {
    fn name(&self) -> &'static str {
        "disconnect"
    }

    fn validate(&self, args: &[String]) -> std::result::Result<(), String> {
        expect_args(args, 1, "Expected one argument: target")?;
        validate_target(&args[0])
    }

    async fn execute(&self, args: &[String], _registry: &CommandRegistry) -> Result<Value> {
        let closed = self
            .0
            .sessions()
            .disconnect(&TargetId::from(args[0].as_str()))
            .await;
        Ok(Value::Bool(closed))
    }
}
