//! flightdeck - A management plane for remote recording agents
//!
//! This crate provides the core functionality for flightdeck, including:
//! - Pooled, serialized sessions to monitored targets
//! - The recording lifecycle (start, save, delete) and its archive
//! - A WebSocket command and notification channel
//! - Automated rules that start recordings on matching targets
//! - The HTTP plane and configuration
//!
//! # Architecture
//!
//! Every interaction with a target runs as a task through the
//! [`session::SessionManager`], which owns at most one live
//! [`agent::AgentSession`] per target. The [`recordings`] orchestrator
//! builds on it and publishes [`protocol::Notification`]s, which the
//! [`server::MessagingServer`] broadcasts to every admitted WebSocket
//! client.

pub mod agent;
pub mod commands;
pub mod config;
pub mod error;
pub mod protocol;
pub mod recordings;
pub mod reports;
pub mod rules;
pub mod server;
pub mod session;
pub mod web;

pub use error::{Error, Result};
