//! Output side of the control surface.
//!
//! Every component pushes [`DisplayEvent`]s into a [`DisplaySink`]; nothing
//! flows back. Event names follow the kebab-case topics a front end listens on.

use std::io::Write;

use log::error;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    link::ConnectionState,
    session::{SessionState, SessionSummary, Telemetry},
    targets::TargetSet,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DisplayEvent {
    ConnectionChanged { status: ConnectionState },
    TargetsChanged { targets: TargetSet },
    SessionStarted {
        session: SessionState,
        telemetry: Telemetry,
    },
    SessionTick { telemetry: Telemetry },
    SessionCompleted { summary: SessionSummary },
    SessionReset,
    Status { level: StatusLevel, message: String },
}

impl DisplayEvent {
    pub fn info(message: impl Into<String>) -> Self {
        DisplayEvent::Status {
            level: StatusLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        DisplayEvent::Status {
            level: StatusLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        DisplayEvent::Status {
            level: StatusLevel::Error,
            message: message.into(),
        }
    }
}

pub trait DisplaySink: Send + Sync {
    fn emit(&self, event: DisplayEvent);
}

/// Forwards events into an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DisplayEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DisplayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DisplaySink for ChannelSink {
    fn emit(&self, event: DisplayEvent) {
        // A closed receiver means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

/// Prints one JSON object per event on stdout.
pub struct JsonLinesSink;

impl DisplaySink for JsonLinesSink {
    fn emit(&self, event: DisplayEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
                    error!("Failed to write display event: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize display event: {}", e),
        }
    }
}
