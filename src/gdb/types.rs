//! GDB Machine Interface (MI) Type Definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// GDB/MI result class types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "done" => Some(ResultClass::Done),
            "running" => Some(ResultClass::Running),
            "connected" => Some(ResultClass::Connected),
            "error" => Some(ResultClass::Error),
            "exit" => Some(ResultClass::Exit),
            _ => None,
        }
    }
}

/// Kind of an async out-of-band record, selected by its leading marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncKind {
    /// `*`
    Exec,
    /// `+`
    Status,
    /// `=`
    Notify,
}

impl AsyncKind {
    pub fn from_marker(c: u8) -> Option<Self> {
        match c {
            b'*' => Some(AsyncKind::Exec),
            b'+' => Some(AsyncKind::Status),
            b'=' => Some(AsyncKind::Notify),
            _ => None,
        }
    }
}

/// Kind of a stream out-of-band record, selected by its leading marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    /// `~`
    Console,
    /// `@`
    Target,
    /// `&`
    Log,
}

impl StreamKind {
    pub fn from_marker(c: u8) -> Option<Self> {
        match c {
            b'~' => Some(StreamKind::Console),
            b'@' => Some(StreamKind::Target),
            b'&' => Some(StreamKind::Log),
            _ => None,
        }
    }
}

/// Stop reason types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    SolibEvent,
    Fork,
    Vfork,
    SyscallEntry,
    SyscallReturn,
    Unknown(String),
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "watchpoint-trigger" => StopReason::WatchpointTrigger,
            "read-watchpoint-trigger" => StopReason::ReadWatchpointTrigger,
            "access-watchpoint-trigger" => StopReason::AccessWatchpointTrigger,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "watchpoint-scope" => StopReason::WatchpointScope,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            "solib-event" => StopReason::SolibEvent,
            "fork" => StopReason::Fork,
            "vfork" => StopReason::Vfork,
            "syscall-entry" => StopReason::SyscallEntry,
            "syscall-return" => StopReason::SyscallReturn,
            _ => StopReason::Unknown(s.to_string()),
        }
    }
}

/// GDB/MI value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiValue {
    /// A decoded c-string
    Const(String),
    /// `{name=value,...}`
    Tuple(Vec<MiResult>),
    /// `[value,...]`
    List(Vec<MiValue>),
    /// `[name=value,...]`
    ResultList(Vec<MiResult>),
    /// Nothing parseable followed `name=`
    Empty,
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::Const(s) => Some(s),
            _ => None,
        }
    }

    /// Named entries of a tuple or result list
    pub fn as_results(&self) -> Option<&[MiResult]> {
        match self {
            MiValue::Tuple(r) | MiValue::ResultList(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Number of elements when this value is any kind of collection
    pub fn len(&self) -> usize {
        match self {
            MiValue::Tuple(r) | MiValue::ResultList(r) => r.len(),
            MiValue::List(l) => l.len(),
            MiValue::Const(_) | MiValue::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// GDB/MI result (variable=value pair)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiResult {
    pub variable: String,
    pub value: MiValue,
}

impl MiResult {
    pub fn new(variable: impl Into<String>, value: MiValue) -> Self {
        Self {
            variable: variable.into(),
            value,
        }
    }
}

/// Out-of-band record: anything on a line other than the terminal result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutOfBandRecord {
    Async {
        kind: AsyncKind,
        class: String,
        output: Vec<MiResult>,
    },
    Stream {
        kind: StreamKind,
        content: String,
    },
}

/// Terminal acknowledgment of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub class: ResultClass,
    pub results: Vec<MiResult>,
}

/// One parsed line of GDB/MI output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiNode {
    pub token: Option<u64>,
    pub out_of_band: Vec<OutOfBandRecord>,
    pub result_record: Option<ResultRecord>,
}

impl MiNode {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.out_of_band.is_empty() && self.result_record.is_none()
    }

    pub fn result_class(&self) -> Option<ResultClass> {
        self.result_record.as_ref().map(|r| r.class)
    }

    /// Result string at `path`, when it resolves to a const
    pub fn result_str(&self, path: &str) -> Option<String> {
        self.result(path).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Out-of-band string at `path`, when it resolves to a const
    pub fn record_str(&self, path: &str) -> Option<String> {
        self.record(path).and_then(|v| v.as_str().map(str::to_string))
    }
}

/// Session execution status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    None,
    Running,
    Stopped,
}

/// Debugger version parsed from the `gdb-version` banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GdbVersion {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for GdbVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Frame information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub level: u64,
    pub addr: String,
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub from: Option<String>,
}

/// Breakpoint to insert, filled in from GDB's `bkpt={...}` reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    /// Location inserted as `*raw`, e.g. an address
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    /// `N` breaks once after N hits, `>N` ignores the first N
    #[serde(default)]
    pub count_condition: Option<String>,
    #[serde(default)]
    pub number: Option<u64>,
}

/// Watchpoint access type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchpointType {
    #[default]
    Write,
    Read,
    Access,
}

/// Data breakpoint (watchpoint) on an expression
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBreakpoint {
    pub exp: String,
    #[serde(default)]
    pub access: WatchpointType,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub count_condition: Option<String>,
    #[serde(default)]
    pub number: Option<u64>,
}

/// Local variable as listed by `stack-list-variables --simple-values`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackVariable {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub var_type: Option<String>,
}

/// Variable as presented to a front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub evaluate_name: String,
    pub value: String,
    #[serde(default)]
    pub var_type: Option<String>,
    /// Handle for fetching children, 0 for scalars
    pub reference: u32,
}

/// How much raw MI traffic to echo back as log messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebugOutput {
    #[default]
    Off,
    /// Parsed records as JSON
    Parsed,
    /// Raw lines and parsed records
    Raw,
    RawOnly,
}

impl DebugOutput {
    pub fn is_on(self) -> bool {
        self != DebugOutput::Off
    }

    pub fn shows_raw(self) -> bool {
        matches!(self, DebugOutput::Raw | DebugOutput::RawOnly)
    }

    pub fn shows_parsed(self) -> bool {
        matches!(self, DebugOutput::Parsed | DebugOutput::Raw)
    }
}

/// GDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GdbConfig {
    pub gdb_path: String,
    pub gdb_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment for the debugger process
    pub env: Vec<(String, String)>,
    pub startup_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub exit_timeout_ms: u64,
    pub detach_timeout_ms: u64,
    /// Refuse to start against a debugger older than this major version
    pub min_major_version: u32,
    pub debug_output: DebugOutput,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb-multiarch".to_string(),
            gdb_args: vec!["--interpreter=mi2".to_string()],
            cwd: None,
            env: Vec::new(),
            startup_timeout_ms: 5000,
            disconnect_timeout_ms: 500,
            exit_timeout_ms: 500,
            detach_timeout_ms: 10,
            min_major_version: 9,
            debug_output: DebugOutput::Off,
            event_capacity: 1024,
        }
    }
}

impl GdbConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn detach_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_timeout_ms)
    }
}
