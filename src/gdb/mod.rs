//! GDB (GNU Debugger) MI Interface Module

pub mod commands;
pub mod error;
pub mod events;
pub mod expansion;
pub mod lines;
pub mod parser;
pub mod query;
pub mod session;
pub mod types;
pub mod varobj;

pub use error::MiError;
pub use events::{MiEvent, MsgKind};
pub use expansion::{Expandable, Expanded, ExpandedVariable, ExpansionTarget, ValueExpander};
pub use parser::MiParser;
pub use session::{CommandReply, MiSession, SendOptions};
pub use types::*;
pub use varobj::{VariableObject, VariableStore};
