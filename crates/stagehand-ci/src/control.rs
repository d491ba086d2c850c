//! Client control messages and their replies.
//!
//! Commands arrive as JSON objects tagged by `command`:
//!
//! ```json
//! {"command": "update-breakpoints", "build_id": "w-1", "breakpoints": {"test": {"before": true}}}
//! {"command": "resume", "build_id": "w-1"}
//! {"command": "console-command", "build_id": "w-1", "text": "ls"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_state::BuildId;

/// A control-channel request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlCommand {
    UpdateBreakpoints {
        build_id: BuildId,
        breakpoints: Value,
    },
    Pause {
        build_id: BuildId,
    },
    Resume {
        build_id: BuildId,
    },
    StartDebug {
        build_id: BuildId,
        /// Informational; the container is derived from the build id.
        #[serde(default)]
        repo: Option<String>,
    },
    StopDebug {
        build_id: BuildId,
    },
    ConsoleCommand {
        build_id: BuildId,
        text: String,
    },
    /// The client went away; every debug session is torn down.
    Disconnect,
}

impl ControlCommand {
    /// Name used in replies and logs.
    pub fn operation(&self) -> &'static str {
        match self {
            ControlCommand::UpdateBreakpoints { .. } => "update-breakpoints",
            ControlCommand::Pause { .. } => "pause",
            ControlCommand::Resume { .. } => "resume",
            ControlCommand::StartDebug { .. } => "start-debug",
            ControlCommand::StopDebug { .. } => "stop-debug",
            ControlCommand::ConsoleCommand { .. } => "console-command",
            ControlCommand::Disconnect => "disconnect",
        }
    }

    pub fn build_id(&self) -> Option<&BuildId> {
        match self {
            ControlCommand::UpdateBreakpoints { build_id, .. }
            | ControlCommand::Pause { build_id }
            | ControlCommand::Resume { build_id }
            | ControlCommand::StartDebug { build_id, .. }
            | ControlCommand::StopDebug { build_id }
            | ControlCommand::ConsoleCommand { build_id, .. } => Some(build_id),
            ControlCommand::Disconnect => None,
        }
    }
}

/// Answer to a [`ControlCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum ControlReply {
    Ok { message: String },
    Error { message: String },
}

impl ControlReply {
    pub fn ok(message: impl Into<String>) -> Self {
        ControlReply::Ok {
            message: message.into(),
        }
    }

    pub fn error(operation: &str, err: impl std::fmt::Display) -> Self {
        ControlReply::Error {
            message: format!("{operation}: {err}"),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ControlReply::Ok { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            ControlReply::Ok { message } | ControlReply::Error { message } => message,
        }
    }
}
