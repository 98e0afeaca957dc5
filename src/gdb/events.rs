//! Events published by a running MI session

use crate::gdb::types::{MiNode, StreamKind};
use serde::Serialize;

/// Channel a text message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    /// Program or debugger text that was not MI
    Stdout,
    /// The debugger's stderr
    Stderr,
    /// `~` console stream
    Console,
    /// `@` target stream
    Target,
    /// `&` log stream, and the engine's own diagnostics
    Log,
}

impl From<StreamKind> for MsgKind {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Console => MsgKind::Console,
            StreamKind::Target => MsgKind::Target,
            StreamKind::Log => MsgKind::Log,
        }
    }
}

/// Session event.
///
/// Stop events carry the whole parsed line so listeners can query thread id,
/// frame and signal details themselves.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MiEvent {
    Running { node: MiNode },
    /// Stop without a recognised reason; `entry` marks the first stop of the
    /// session when no reason was given at all
    Stopped { node: MiNode, entry: bool },
    Breakpoint { node: MiNode },
    Watchpoint { node: MiNode },
    WatchpointScope { node: MiNode },
    StepEnd { node: MiNode },
    StepOutEnd { node: MiNode },
    SignalStop { node: MiNode },
    ExitedNormally { node: MiNode },
    /// Follows every stop event, whatever the reason
    GenericStopped { node: MiNode },
    /// An `exec-continue` was rejected while the program already ran
    ContinueFailed { node: MiNode },
    ThreadCreated { thread_id: u64, group_id: String },
    ThreadExited { thread_id: u64, group_id: String },
    ThreadSelected { thread_id: u64 },
    ThreadGroupExited { group_id: String, exit_code: Option<String> },
    /// The debugger process is gone
    Quit,
    Msg { kind: MsgKind, text: String },
}

impl MiEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            MiEvent::Running { .. } => "running",
            MiEvent::Stopped { .. } => "stopped",
            MiEvent::Breakpoint { .. } => "breakpoint",
            MiEvent::Watchpoint { .. } => "watchpoint",
            MiEvent::WatchpointScope { .. } => "watchpoint-scope",
            MiEvent::StepEnd { .. } => "step-end",
            MiEvent::StepOutEnd { .. } => "step-out-end",
            MiEvent::SignalStop { .. } => "signal-stop",
            MiEvent::ExitedNormally { .. } => "exited-normally",
            MiEvent::GenericStopped { .. } => "generic-stopped",
            MiEvent::ContinueFailed { .. } => "continue-failed",
            MiEvent::ThreadCreated { .. } => "thread-created",
            MiEvent::ThreadExited { .. } => "thread-exited",
            MiEvent::ThreadSelected { .. } => "thread-selected",
            MiEvent::ThreadGroupExited { .. } => "thread-group-exited",
            MiEvent::Quit => "quit",
            MiEvent::Msg { .. } => "msg",
        }
    }

    pub(crate) fn msg(kind: MsgKind, text: impl Into<String>) -> Self {
        MiEvent::Msg {
            kind,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_serialized_tag() {
        let events = vec![
            MiEvent::Stopped {
                node: MiNode::default(),
                entry: true,
            },
            MiEvent::ContinueFailed {
                node: MiNode::default(),
            },
            MiEvent::ThreadGroupExited {
                group_id: "i1".to_string(),
                exit_code: None,
            },
            MiEvent::Quit,
            MiEvent::msg(MsgKind::Console, "hi"),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[test]
    fn test_msg_serialization() {
        let json = serde_json::to_string(&MiEvent::msg(MsgKind::Stderr, "oops")).unwrap();
        assert_eq!(json, r#"{"event":"msg","kind":"stderr","text":"oops"}"#);
    }
}
