//! Node status signals and the event channel they travel on.
//!
//! Status is advisory: emitting never blocks and never fails, even when
//! nobody is listening any more.

use crate::error::ErrorRecord;
use crate::models::FlowMessage;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Red,
    Green,
    Blue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Ring,
    Dot,
}

/// Status indicator shown under the node in the host UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<StatusFill>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<StatusShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    /// Empty status, clears the indicator.
    pub fn clear() -> Self {
        Self::default()
    }

    pub fn requesting() -> Self {
        Self::new(StatusFill::Blue, StatusShape::Dot, "requesting")
    }

    pub fn done() -> Self {
        Self::new(StatusFill::Green, StatusShape::Dot, "done")
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self::new(StatusFill::Red, StatusShape::Ring, text)
    }

    fn new(fill: StatusFill, shape: StatusShape, text: impl Into<String>) -> Self {
        Self {
            fill: Some(fill),
            shape: Some(shape),
            text: Some(text.into()),
        }
    }

    pub fn is_clear(&self) -> bool {
        self.fill.is_none() && self.shape.is_none() && self.text.is_none()
    }
}

/// Everything a node hands back to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum NodeEvent {
    Status(NodeStatus),
    /// Normal output.
    Send { msg: FlowMessage },
    /// Fatal escalation; the message does not continue on the normal output.
    Error { error: ErrorRecord, msg: FlowMessage },
}

/// Non-blocking sender half of a node's event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the host drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: NodeEvent) {
        // A closed receiver means the host is tearing down.
        let _ = self.tx.send(event);
    }

    pub fn status(&self, status: NodeStatus) {
        self.emit(NodeEvent::Status(status));
    }
}
