//! GDB/MI engine errors

use thiserror::Error;

/// Errors surfaced by the MI engine.
///
/// Only `Command` carries text produced by the debugger itself; the others
/// describe what went wrong on our side of the pipe.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MiError {
    /// Writing to the debugger failed, or there is no debugger to write to.
    #[error("transport error: {0}")]
    Transport(String),

    /// A line could not be parsed into any known record shape.
    #[error("unparseable MI output: {0}")]
    Protocol(String),

    /// The debugger answered a command with `^error`.
    #[error("{message} (from: {command})")]
    Command { message: String, command: String },

    /// The debugger exited while the command was still pending.
    #[error("debugger exited before answering")]
    Exited,

    #[error("startup failed: {0}")]
    Startup(String),
}

impl MiError {
    /// The debugger-supplied message for `Command` errors, verbatim.
    pub fn debugger_message(&self) -> Option<&str> {
        match self {
            MiError::Command { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MiError {
    fn from(e: std::io::Error) -> Self {
        MiError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = MiError::Command {
            message: "No symbol \"foo\" in current context.".to_string(),
            command: "data-evaluate-expression foo".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No symbol \"foo\" in current context. (from: data-evaluate-expression foo)"
        );
        assert_eq!(err.debugger_message(), Some("No symbol \"foo\" in current context."));
    }

    #[test]
    fn test_io_error_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: MiError = io.into();
        assert!(matches!(err, MiError::Transport(_)));
        assert_eq!(err.debugger_message(), None);
    }
}
