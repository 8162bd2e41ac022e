//! Per-action progress events.

use crate::core::path::RelPath;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    CreateDirectory,
    Transfer,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::CreateDirectory => write!(f, "mkdir"),
            ActionKind::Transfer => write!(f, "transfer"),
            ActionKind::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Started,
    Succeeded,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        self != Outcome::Started
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub path: RelPath,
    pub action: ActionKind,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
}

impl ProgressEvent {
    pub fn started(path: &RelPath, action: ActionKind) -> Self {
        Self::new(path, action, Outcome::Started)
    }

    pub fn succeeded(path: &RelPath, action: ActionKind, bytes: Option<u64>) -> Self {
        Self {
            bytes_transferred: bytes,
            ..Self::new(path, action, Outcome::Succeeded)
        }
    }

    pub fn failed(path: &RelPath, action: ActionKind, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(path, action, Outcome::Failed)
        }
    }

    pub fn skipped(path: &RelPath, action: ActionKind, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(path, action, Outcome::Skipped)
        }
    }

    fn new(path: &RelPath, action: ActionKind, outcome: Outcome) -> Self {
        Self {
            path: path.clone(),
            action,
            outcome,
            error: None,
            bytes_transferred: None,
        }
    }
}

type Callback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Disabled,
    Channel(mpsc::UnboundedSender<ProgressEvent>),
    Callback(Callback),
}

/// Where progress events go. Cloned into every transfer task.
///
/// Emitting never blocks: the channel is unbounded and a dropped receiver
/// silently discards events. A callback runs on the emitting task and must
/// return quickly.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Sink,
}

impl ProgressReporter {
    pub fn disabled() -> Self {
        Self {
            sink: Sink::Disabled,
        }
    }

    /// A reporter plus the receiving end of its event channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::from_sender(tx), rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            sink: Sink::Channel(tx),
        }
    }

    pub fn from_callback<F>(callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        Self {
            sink: Sink::Callback(Arc::new(callback)),
        }
    }

    pub fn emit(&self, event: ProgressEvent) {
        match &self.sink {
            Sink::Disabled => {}
            Sink::Channel(tx) => {
                let _ = tx.send(event);
            }
            Sink::Callback(callback) => callback(&event),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.sink {
            Sink::Disabled => "disabled",
            Sink::Channel(_) => "channel",
            Sink::Callback(_) => "callback",
        };
        f.debug_struct("ProgressReporter").field("sink", &kind).finish()
    }
}
