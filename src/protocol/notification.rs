//! Notifications published by any component and broadcast to every
//! WebSocket client

use crate::agent::TargetId;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const CLIENT_CONNECTED: &str = "client_connected";
pub const CLIENT_DISCONNECTED: &str = "client_disconnected";
pub const CLIENT_DROPPED: &str = "client_dropped";
pub const RECORDING_CREATED: &str = "RecordingCreated";

/// Media type of a notification's message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaType {
    #[serde(rename = "type")]
    pub mime: String,
    #[serde(rename = "subType")]
    pub subtype: String,
}

impl MetaType {
    pub fn new(mime: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            subtype: subtype.into(),
        }
    }

    pub fn json() -> Self {
        Self::new("application", "json")
    }

    pub fn plain_text() -> Self {
        Self::new("text", "plain")
    }
}

/// An immutable event notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    category: String,
    meta_type: MetaType,
    message: Value,
}

impl Notification {
    pub fn new(category: impl Into<String>, meta_type: MetaType, message: Value) -> Self {
        Self {
            category: category.into(),
            meta_type,
            message,
        }
    }

    pub fn text(category: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(category, MetaType::plain_text(), Value::String(text.into()))
    }

    pub fn recording_created(recording: &str, target: &TargetId) -> Self {
        Self::new(
            RECORDING_CREATED,
            MetaType::json(),
            json!({ "recording": recording, "target": target }),
        )
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn meta_type(&self) -> &MetaType {
        &self.meta_type
    }

    pub fn message(&self) -> &Value {
        &self.message
    }
}

/// Wire shape: `{"meta": {"category": .., "type": {..}}, "message": ..}`
impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Meta<'a> {
            category: &'a str,
            #[serde(rename = "type")]
            meta_type: &'a MetaType,
        }

        let mut state = serializer.serialize_struct("Notification", 2)?;
        state.serialize_field(
            "meta",
            &Meta {
                category: &self.category,
                meta_type: &self.meta_type,
            },
        )?;
        state.serialize_field("message", &self.message)?;
        state.end()
    }
}

/// Cloneable publishing handle for the notification feed
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, notification: Notification) {
        tracing::debug!("Publishing {} notification", notification.category());
        if self.tx.send(notification).is_err() {
            tracing::warn!("Notification feed closed; dropping notification");
        }
    }
}
