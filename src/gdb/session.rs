//! GDB/MI Session
//!
//! Manages the debugger process lifecycle and multiplexes MI commands over its
//! pipes: one command in flight at a time, replies matched by token, and
//! everything else fanned out as [`MiEvent`]s.

use crate::gdb::commands::escape;
use crate::gdb::error::{MiError, Result};
use crate::gdb::events::{MiEvent, MsgKind};
use crate::gdb::lines::LineAssembler;
use crate::gdb::parser::MiParser;
use crate::gdb::query::value_of_results;
use crate::gdb::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-command behaviour flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Resolve an `^error` reply instead of failing with [`MiError::Command`]
    pub suppress_failure: bool,
    /// Collect console stream text into the reply instead of publishing it
    pub swallow_stdout: bool,
    /// Keep this command out of the raw traffic echo
    pub force_no_debug: bool,
}

impl SendOptions {
    pub fn suppress_failure(mut self) -> Self {
        self.suppress_failure = true;
        self
    }

    pub fn swallow_stdout(mut self) -> Self {
        self.swallow_stdout = true;
        self
    }

    pub fn force_no_debug(mut self) -> Self {
        self.force_no_debug = true;
        self
    }
}

/// Result record of a command plus any console text it captured
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub node: MiNode,
    pub console: String,
}

struct Pending {
    command: String,
    options: SendOptions,
    tx: oneshot::Sender<Result<CommandReply>>,
}

#[derive(Default)]
struct SessionState {
    pending: HashMap<u64, Pending>,
    status: SessionStatus,
    last_continue_token: Option<u64>,
    /// Console capture for the in-flight command, keyed by its token
    capture: Option<(u64, String)>,
    seen_first_stop: bool,
    exited: bool,
}

/// Drops a command's handler and console capture when its caller stops
/// waiting, e.g. under a `timeout`
struct PendingGuard<'a> {
    shared: &'a Shared,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state.pending.remove(&self.token).is_some() {
            debug!("Command {} abandoned before its reply", self.token);
        }
        if matches!(state.capture, Some((owner, _)) if owner == self.token) {
            state.capture = None;
        }
    }
}

/// State shared with the reader tasks
struct Shared {
    state: Mutex<SessionState>,
    events: broadcast::Sender<MiEvent>,
    exited: watch::Sender<bool>,
    parser: MiParser,
    debug_output: DebugOutput,
}

impl Shared {
    fn emit(&self, event: MiEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn log(&self, kind: MsgKind, text: impl Into<String>) {
        self.emit(MiEvent::msg(kind, text));
    }

    /// Handle one complete line from the debugger's stdout
    fn handle_line(&self, line: &str) {
        if self.parser.could_be_output(line) {
            if !self.parser.is_prompt(line) && !line.is_empty() {
                self.log(MsgKind::Stdout, line);
            }
            return;
        }

        let node = match self.parser.parse_line(line) {
            Ok(node) => node,
            Err(e) => {
                warn!("Failed to parse line: {} - {}", line, e);
                return;
            }
        };

        if self.debug_output.is_on() && !self.quiet() {
            if self.debug_output.shows_raw() {
                self.log(MsgKind::Log, format!("-> {}", line));
            }
            if self.debug_output.shows_parsed() {
                match serde_json::to_string(&node) {
                    Ok(json) => self.log(MsgKind::Log, format!("GDB -> App: {}", json)),
                    Err(e) => debug!("Failed to serialize record: {}", e),
                }
            }
        }

        self.dispatch(node);
    }

    /// True while a command that asked to stay out of the echo is in flight
    fn quiet(&self) -> bool {
        self.state
            .lock()
            .pending
            .values()
            .any(|p| p.options.force_no_debug)
    }

    fn dispatch(&self, node: MiNode) {
        for record in &node.out_of_band {
            match record {
                OutOfBandRecord::Stream { kind, content } => self.handle_stream(*kind, content),
                OutOfBandRecord::Async {
                    kind: AsyncKind::Exec,
                    class,
                    output,
                } => self.handle_exec(class, output, &node),
                OutOfBandRecord::Async {
                    kind: AsyncKind::Notify,
                    class,
                    output,
                } => self.handle_notify(class, output),
                OutOfBandRecord::Async {
                    kind: AsyncKind::Status,
                    class,
                    ..
                } => debug!("Status record: {}", class),
            }
        }

        if let Some(record) = &node.result_record {
            self.handle_result(&node, record);
        }
    }

    fn handle_stream(&self, kind: StreamKind, content: &str) {
        if kind == StreamKind::Console {
            let mut state = self.state.lock();
            if let Some((_, captured)) = state.capture.as_mut() {
                captured.push_str(content);
                return;
            }
        }
        self.log(kind.into(), content);
    }

    fn handle_exec(&self, class: &str, output: &[MiResult], node: &MiNode) {
        match class {
            "running" => {
                self.state.lock().status = SessionStatus::Running;
                self.emit(MiEvent::Running { node: node.clone() });
            }
            "stopped" => {
                let first_stop = {
                    let mut state = self.state.lock();
                    state.status = SessionStatus::Stopped;
                    !std::mem::replace(&mut state.seen_first_stop, true)
                };
                let reason = value_of_results(output, "reason")
                    .and_then(|v| v.as_str().map(str::to_string));
                debug!("Stopped: {:?}", reason);

                let node = node.clone();
                let event = match reason.as_deref().map(StopReason::from) {
                    Some(StopReason::BreakpointHit) => MiEvent::Breakpoint { node: node.clone() },
                    Some(
                        StopReason::WatchpointTrigger
                        | StopReason::ReadWatchpointTrigger
                        | StopReason::AccessWatchpointTrigger,
                    ) => MiEvent::Watchpoint { node: node.clone() },
                    Some(StopReason::WatchpointScope) => MiEvent::WatchpointScope { node: node.clone() },
                    Some(StopReason::EndSteppingRange) => MiEvent::StepEnd { node: node.clone() },
                    Some(StopReason::FunctionFinished) => MiEvent::StepOutEnd { node: node.clone() },
                    Some(StopReason::SignalReceived) => MiEvent::SignalStop { node: node.clone() },
                    Some(StopReason::ExitedNormally) => MiEvent::ExitedNormally { node: node.clone() },
                    Some(StopReason::Exited) => {
                        let code = value_of_results(output, "exit-code")
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default();
                        self.log(MsgKind::Stderr, format!("Program exited with code {}\n", code));
                        MiEvent::ExitedNormally { node: node.clone() }
                    }
                    Some(StopReason::Unknown(other)) if other.contains("watchpoint-trigger") => {
                        MiEvent::Watchpoint { node: node.clone() }
                    }
                    Some(StopReason::Unknown(other)) if other.contains("watchpoint-scope") => {
                        MiEvent::WatchpointScope { node: node.clone() }
                    }
                    None if first_stop => {
                        self.log(
                            MsgKind::Console,
                            "Program stopped, probably due to a reset and/or halt issued by debugger\n",
                        );
                        MiEvent::Stopped {
                            node: node.clone(),
                            entry: true,
                        }
                    }
                    _ => {
                        self.log(
                            MsgKind::Console,
                            format!(
                                "Not implemented stop reason (assuming exception): {}\n",
                                reason.as_deref().unwrap_or("Unknown reason")
                            ),
                        );
                        MiEvent::Stopped {
                            node: node.clone(),
                            entry: false,
                        }
                    }
                };
                self.emit(event);
                self.emit(MiEvent::GenericStopped { node });
            }
            _ => debug!("Unhandled exec record: {}", class),
        }
    }

    fn handle_notify(&self, class: &str, output: &[MiResult]) {
        let field = |name: &str| {
            output
                .iter()
                .find(|r| r.variable == name)
                .and_then(|r| r.value.as_str())
                .map(str::to_string)
        };
        let thread_id = || field("id").and_then(|id| id.parse::<u64>().ok());

        let event = match class {
            "thread-created" | "thread-exited" | "thread-selected" => {
                let Some(thread_id) = thread_id() else {
                    warn!("{} without a numeric id", class);
                    return;
                };
                let group_id = field("group-id").unwrap_or_default();
                match class {
                    "thread-created" => MiEvent::ThreadCreated { thread_id, group_id },
                    "thread-exited" => MiEvent::ThreadExited { thread_id, group_id },
                    _ => MiEvent::ThreadSelected { thread_id },
                }
            }
            "thread-group-exited" => MiEvent::ThreadGroupExited {
                group_id: field("id").unwrap_or_default(),
                exit_code: field("exit-code"),
            },
            _ => {
                debug!("Unhandled notification: {}", class);
                return;
            }
        };
        self.emit(event);
    }

    fn handle_result(&self, node: &MiNode, record: &ResultRecord) {
        let Some(token) = node.token else {
            if record.class == ResultClass::Error {
                let msg = node.result_str("msg").unwrap_or_default();
                self.log(MsgKind::Stderr, format!("{}\n", msg));
            }
            return;
        };

        let (pending, console, race) = {
            let mut state = self.state.lock();
            let pending = state.pending.remove(&token);
            let console = match state.capture.take() {
                Some((owner, captured)) if owner == token => captured,
                other => {
                    state.capture = other;
                    String::new()
                }
            };
            let race = pending.is_none()
                && record.class == ResultClass::Error
                && state.last_continue_token == Some(token);
            if race {
                state.status = SessionStatus::Stopped;
            }
            (pending, console, race)
        };

        if race {
            warn!("exec-continue (token {}) failed after reporting running", token);
            self.emit(MiEvent::ContinueFailed { node: node.clone() });
            return;
        }

        let Some(pending) = pending else {
            warn!("Multiple results or no handler for token {}", token);
            if record.class == ResultClass::Error {
                let msg = node.result_str("msg").unwrap_or_default();
                self.log(MsgKind::Stderr, format!("{}\n", msg));
            }
            return;
        };

        let outcome = if record.class == ResultClass::Error && !pending.options.suppress_failure {
            Err(MiError::Command {
                message: node
                    .result_str("msg")
                    .unwrap_or_else(|| "Internal error".to_string()),
                command: pending.command,
            })
        } else {
            if record.class == ResultClass::Error {
                warn!("Error executing command '{}'", pending.command);
                self.log(
                    MsgKind::Stderr,
                    format!("WARNING: Error executing command '{}'\n", pending.command),
                );
            }
            Ok(CommandReply {
                node: node.clone(),
                console,
            })
        };

        // The caller may have given up waiting
        let _ = pending.tx.send(outcome);
    }

    /// The debugger's output closed: fail everything still waiting
    fn on_exit(&self) {
        let pending = {
            let mut state = self.state.lock();
            if state.exited {
                return;
            }
            state.exited = true;
            state.status = SessionStatus::None;
            state.capture = None;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            warn!("GDB exited with {} command(s) pending", pending.len());
        }
        // Dropping the senders fails each waiter with `MiError::Exited`
        drop(pending);

        info!("GDB exited");
        self.exited.send_replace(true);
        self.emit(MiEvent::Quit);
    }
}

/// GDB/MI session for one debugger process
pub struct MiSession {
    config: GdbConfig,
    shared: Arc<Shared>,
    /// Token counter for MI commands
    next_token: AtomicU64,
    /// Held from writing a command until its reply, so commands run FIFO
    lane: AsyncMutex<()>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    child: AsyncMutex<Option<Child>>,
    stopping: AtomicBool,
    version: Mutex<Option<GdbVersion>>,
}

impl MiSession {
    /// Create a session; nothing runs until [`start`](Self::start) or
    /// [`attach`](Self::attach)
    pub fn new(config: GdbConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (exited, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::default()),
            events,
            exited,
            parser: MiParser::new(),
            debug_output: config.debug_output,
        });

        Self {
            config,
            shared,
            next_token: AtomicU64::new(1),
            lane: AsyncMutex::new(()),
            writer: AsyncMutex::new(None),
            child: AsyncMutex::new(None),
            stopping: AtomicBool::new(false),
            version: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GdbConfig {
        &self.config
    }

    /// Receive session events from now on.
    ///
    /// Each subscriber buffers up to `event_capacity` events. One that falls
    /// further behind loses the oldest ones, stops and `Quit` included, and
    /// its next `recv` reports `RecvError::Lagged` with the number skipped.
    pub fn subscribe(&self) -> broadcast::Receiver<MiEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.state.lock().status
    }

    pub fn version(&self) -> Option<GdbVersion> {
        *self.version.lock()
    }

    pub fn has_exited(&self) -> bool {
        *self.shared.exited.borrow()
    }

    /// Publish a `msg` event
    pub(crate) fn log(&self, kind: MsgKind, text: impl Into<String>) {
        self.shared.log(kind, text);
    }

    /// Spawn the debugger, verify its version and run `init_commands`
    pub async fn start(&self, init_commands: &[String]) -> Result<()> {
        if self.writer.lock().await.is_some() {
            return Err(MiError::Startup("session already started".to_string()));
        }

        info!("Starting GDB: {} {}", self.config.gdb_path, self.config.gdb_args.join(" "));

        let mut cmd = Command::new(&self.config.gdb_path);
        cmd.args(&self.config.gdb_args)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut process = cmd
            .spawn()
            .map_err(|e| MiError::Startup(format!("failed to spawn {}: {}", self.config.gdb_path, e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| MiError::Startup("failed to get stdin".to_string()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| MiError::Startup("failed to get stdout".to_string()))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| MiError::Startup("failed to get stderr".to_string()))?;

        *self.child.lock().await = Some(process);
        self.attach(stdout, stdin).await;
        self.attach_stderr(stderr);

        if let Err(e) = self.initialize(init_commands).await {
            error!("GDB startup failed: {}", e);
            self.kill().await;
            return Err(e);
        }

        info!("GDB started successfully");
        Ok(())
    }

    /// Drive an already-connected debugger over `reader`/`writer`
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.writer.lock().await = Some(Box::new(writer));

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            Self::read_output_loop(reader, &shared).await;
            shared.on_exit();
        });
    }

    /// Publish the debugger's stderr as `msg(stderr)` events
    pub fn attach_stderr<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut reader = reader;
            let mut lines = LineAssembler::new();
            let mut buf = vec![0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in lines.feed(&buf[..n]) {
                            debug!("GDB stderr: {}", line);
                            shared.log(MsgKind::Stderr, format!("{}\n", line));
                        }
                    }
                    Err(e) => {
                        error!("Error reading GDB stderr: {}", e);
                        break;
                    }
                }
            }
            if let Some(rest) = lines.take_remainder() {
                shared.log(MsgKind::Stderr, rest);
            }
        });
    }

    /// Read output loop (runs in a background task)
    async fn read_output_loop<R: AsyncRead + Unpin>(mut reader: R, shared: &Shared) {
        let mut lines = LineAssembler::new();
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in lines.feed(&buf[..n]) {
                        shared.handle_line(&line);
                    }
                }
                Err(e) => {
                    error!("Error reading GDB output: {}", e);
                    break;
                }
            }
        }
        if let Some(rest) = lines.take_remainder() {
            debug!("Unterminated output at EOF: {}", rest);
            shared.handle_line(&rest);
        }
        info!("GDB output reader stopped");
    }

    /// Version handshake, bounded by the startup timeout, then `init_commands`
    pub async fn initialize(&self, init_commands: &[String]) -> Result<()> {
        let limit = self.config.startup_timeout();
        let version = timeout(limit, self.handshake()).await.map_err(|_| {
            MiError::Startup(format!("no response from GDB within {} ms", limit.as_millis()))
        })??;

        match version {
            Some(version) if version.major < self.config.min_major_version => {
                return Err(MiError::Startup(format!(
                    "GDB {} is not supported, version {} or later is required",
                    version, self.config.min_major_version
                )));
            }
            Some(version) => info!("GDB version {}", version),
            None => warn!("Could not determine GDB version, continuing"),
        }
        *self.version.lock() = version;

        self.run_sequence(init_commands).await
    }

    async fn handshake(&self) -> Result<Option<GdbVersion>> {
        self.send_with("gdb-set target-async on", SendOptions::default().suppress_failure())
            .await?;
        let reply = self
            .send_with("gdb-version", SendOptions::default().swallow_stdout())
            .await?;

        let (version, banner_start) = match self.shared.parser.parse_version_banner(&reply.console) {
            Some((version, start)) => (Some(version), start),
            None => (None, reply.console.len()),
        };
        let preamble = &reply.console[..banner_start];
        if !preamble.trim().is_empty() {
            self.shared.log(MsgKind::Console, preamble);
        }
        Ok(version)
    }

    /// Send an MI command (without the leading `-`) and wait for its reply
    pub async fn send(&self, command: &str) -> Result<MiNode> {
        self.send_with(command, SendOptions::default())
            .await
            .map(|reply| reply.node)
    }

    pub async fn send_with(&self, command: &str, options: SendOptions) -> Result<CommandReply> {
        let _lane = self.lane.lock().await;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        let rx = {
            let mut state = self.shared.state.lock();
            if state.exited {
                return Err(MiError::Transport("GDB is not running".to_string()));
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                token,
                Pending {
                    command: command.to_string(),
                    options,
                    tx,
                },
            );
            if command.starts_with("exec-continue") {
                state.last_continue_token = Some(token);
            }
            if options.swallow_stdout {
                state.capture = Some((token, String::new()));
            }
            rx
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            token,
        };

        let line = format!("{}-{}", token, command);
        debug!("Sending command: {}", line);
        if self.shared.debug_output.is_on() && !options.force_no_debug {
            self.shared.log(MsgKind::Log, format!("{}\n", line));
        }

        self.write_line(&line).await?;
        rx.await.unwrap_or(Err(MiError::Exited))
    }

    /// Write a line with no token and no reply tracking
    pub async fn send_raw(&self, raw: &str) -> Result<()> {
        if self.shared.debug_output.is_on() {
            self.shared.log(MsgKind::Log, format!("{}\n", raw));
        }
        self.write_line(raw).await
    }

    /// `-cmd` goes out as an MI command, anything else as a console command
    pub async fn send_user_input(&self, input: &str) -> Result<MiNode> {
        match input.strip_prefix('-') {
            Some(command) => self.send(command).await,
            None => {
                self.send(&format!("interpreter-exec console \"{}\"", escape(input)))
                    .await
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| MiError::Transport("GDB is not running".to_string()))?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Disconnect and exit, killing the debugger if either step stalls.
    /// Calling it again while a stop is under way does nothing.
    pub async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("Stop already in progress");
            return Ok(());
        }

        if !self.has_exited() {
            let disconnect = timeout(
                self.config.disconnect_timeout(),
                self.send_with("target-disconnect", SendOptions::default().suppress_failure()),
            )
            .await;
            match disconnect {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("target-disconnect failed: {}", e),
                Err(_) => warn!("target-disconnect timed out"),
            }

            if let Err(e) = self.send_raw("-gdb-exit").await {
                debug!("Failed to send -gdb-exit: {}", e);
            }

            let mut exited = self.shared.exited.subscribe();
            let graceful = matches!(
                timeout(self.config.exit_timeout(), exited.wait_for(|done| *done)).await,
                Ok(Ok(_))
            );
            if !graceful {
                warn!("GDB did not exit in time, killing it");
                self.kill().await;
            }
        }

        self.reap().await;
        info!("GDB stopped");
        Ok(())
    }

    /// `target-detach` with a short grace period, then [`stop`](Self::stop)
    pub async fn detach(&self) -> Result<()> {
        match timeout(self.config.detach_timeout(), self.send("target-detach")).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("target-detach failed, target probably running: {}", e),
            Err(_) => debug!("target-detach hung, target probably running"),
        }
        self.stop().await
    }

    async fn kill(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill GDB: {}", e);
            }
        }
        // Closing stdin ends a transport that has no process behind it
        self.writer.lock().await.take();
        if self.child.lock().await.is_none() {
            self.shared.on_exit();
        }
    }

    async fn reap(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match timeout(self.config.exit_timeout(), child.wait()).await {
            Ok(Ok(status)) => debug!("GDB exit status: {}", status),
            Ok(Err(e)) => warn!("Failed to wait for GDB: {}", e),
            Err(_) => {
                warn!("GDB still running after kill");
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio_test::{assert_err, assert_ok};

    /// Debugger end of an in-memory transport
    pub(crate) struct FakeGdb {
        commands: Lines<BufReader<ReadHalf<DuplexStream>>>,
        output: WriteHalf<DuplexStream>,
    }

    impl FakeGdb {
        pub(crate) async fn next_command(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.commands.next_line())
                .await
                .expect("command in time")
                .unwrap()
                .expect("command line")
        }

        pub(crate) async fn reply(&mut self, text: &str) {
            self.output.write_all(text.as_bytes()).await.unwrap();
            self.output.flush().await.unwrap();
        }

        /// Read the next command and answer it with `^done<suffix>`
        pub(crate) async fn answer(&mut self, expected: &str, suffix: &str) -> u64 {
            let line = self.next_command().await;
            let (token, command) = line.split_once('-').unwrap();
            assert_eq!(command, expected);
            self.reply(&format!("{}^done{}\n(gdb)\n", token, suffix)).await;
            token.parse().unwrap()
        }

        pub(crate) async fn hang_up(mut self) {
            self.output.shutdown().await.unwrap();
        }
    }

    pub(crate) async fn connected(config: GdbConfig) -> (Arc<MiSession>, FakeGdb) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let session = Arc::new(MiSession::new(config));
        session.attach(our_read, our_write).await;
        let fake = FakeGdb {
            commands: BufReader::new(their_read).lines(),
            output: their_write,
        };
        (session, fake)
    }

    async fn next_event(events: &mut broadcast::Receiver<MiEvent>) -> MiEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .unwrap()
    }

    /// Skip `msg` events
    async fn next_non_msg(events: &mut broadcast::Receiver<MiEvent>) -> MiEvent {
        loop {
            let event = next_event(events).await;
            if !matches!(event, MiEvent::Msg { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_send_writes_token_and_resolves() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("data-evaluate-expression 1+1").await }
        });
        assert_eq!(gdb.next_command().await, "1-data-evaluate-expression 1+1");
        gdb.reply("1^done,value=\"2\"\n(gdb) \n").await;

        let node = assert_ok!(task.await.unwrap());
        assert_eq!(node.token, Some(1));
        assert_eq!(node.result_str("value").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_commands_run_fifo_one_at_a_time() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let mut tasks = Vec::new();
        for name in ["a", "b", "c"] {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                session.send(&format!("var-evaluate-expression {}", name)).await
            }));
            // Let each task queue up before the next one
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for (expected_token, name) in [(1u64, "a"), (2, "b"), (3, "c")] {
            let line = gdb.next_command().await;
            assert_eq!(line, format!("{}-var-evaluate-expression {}", expected_token, name));
            // Nothing else is written while this command is outstanding
            let early = tokio::time::timeout(Duration::from_millis(50), gdb.commands.next_line()).await;
            assert!(early.is_err(), "second command written before reply");
            gdb.reply(&format!("{}^done,value=\"{}\"\n", expected_token, name)).await;
        }

        for (task, name) in tasks.into_iter().zip(["a", "b", "c"]) {
            let node = assert_ok!(task.await.unwrap());
            assert_eq!(node.result_str("value").as_deref(), Some(name));
        }
    }

    #[tokio::test]
    async fn test_error_result_rejects_with_message() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("data-evaluate-expression foo").await }
        });
        gdb.next_command().await;
        gdb.reply("1^error,msg=\"No symbol \\\"foo\\\" in current context.\"\n").await;

        let err = assert_err!(task.await.unwrap());
        assert_eq!(
            err,
            MiError::Command {
                message: "No symbol \"foo\" in current context.".to_string(),
                command: "data-evaluate-expression foo".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_suppress_failure_resolves_error() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .send_with("gdb-set target-async on", SendOptions::default().suppress_failure())
                    .await
            }
        });
        gdb.next_command().await;
        gdb.reply("1^error,msg=\"nope\"\n").await;

        let reply = assert_ok!(task.await.unwrap());
        assert_eq!(reply.node.result_class(), Some(ResultClass::Error));
    }

    #[tokio::test]
    async fn test_swallow_stdout_captures_console() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .send_with("gdb-version", SendOptions::default().swallow_stdout())
                    .await
            }
        });
        gdb.next_command().await;
        gdb.reply("~\"GNU gdb (GDB) 13.1\\n\"\n~\"Copyright\\n\"\n@\"target says hi\\n\"\n1^done\n")
            .await;

        let reply = assert_ok!(task.await.unwrap());
        assert_eq!(reply.console, "GNU gdb (GDB) 13.1\nCopyright\n");
        // Only the target stream reached subscribers
        assert_eq!(
            next_event(&mut events).await,
            MiEvent::msg(MsgKind::Target, "target says hi\n")
        );
    }

    #[tokio::test]
    async fn test_continue_race_marks_stopped() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("exec-continue --thread 1").await }
        });
        gdb.next_command().await;
        gdb.reply("1^running\n*running,thread-id=\"all\"\n").await;
        let node = assert_ok!(task.await.unwrap());
        assert_eq!(node.result_class(), Some(ResultClass::Running));

        assert!(matches!(next_non_msg(&mut events).await, MiEvent::Running { .. }));
        assert_eq!(session.status(), SessionStatus::Running);

        gdb.reply("1^error,msg=\"Cannot execute this command while the target is running.\"\n")
            .await;
        assert!(matches!(next_non_msg(&mut events).await, MiEvent::ContinueFailed { .. }));
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_out_of_band_dispatched_before_result() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("exec-next --thread 1").await }
        });
        gdb.next_command().await;
        gdb.reply("*running,thread-id=\"all\"1^running\n").await;
        assert_ok!(task.await.unwrap());
        // The running event was already published when the reply resolved
        assert!(matches!(events.try_recv(), Ok(MiEvent::Running { .. })));
    }

    #[tokio::test]
    async fn test_stop_events_are_classified() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        gdb.reply("*stopped,frame={addr=\"0x0800\",func=\"Reset_Handler\"},thread-id=\"1\"\n")
            .await;
        match next_non_msg(&mut events).await {
            MiEvent::Stopped { entry, node } => {
                assert!(entry);
                assert_eq!(node.record_str("frame.func").as_deref(), Some("Reset_Handler"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(next_non_msg(&mut events).await, MiEvent::GenericStopped { .. }));
        assert_eq!(session.status(), SessionStatus::Stopped);

        let cases = [
            ("breakpoint-hit", "breakpoint"),
            ("access-watchpoint-trigger", "watchpoint"),
            ("watchpoint-scope", "watchpoint-scope"),
            ("end-stepping-range", "step-end"),
            ("function-finished", "step-out-end"),
            ("signal-received", "signal-stop"),
            ("exited-normally", "exited-normally"),
            ("exited", "exited-normally"),
            ("no-history", "stopped"),
        ];
        for (reason, expected) in cases {
            gdb.reply(&format!("*stopped,reason=\"{}\",exit-code=\"01\"\n", reason)).await;
            let event = next_non_msg(&mut events).await;
            assert_eq!(event.name(), expected, "reason {}", reason);
            if let MiEvent::Stopped { entry, .. } = event {
                assert!(!entry);
            }
            assert_eq!(next_non_msg(&mut events).await.name(), "generic-stopped");
        }
    }

    #[tokio::test]
    async fn test_notify_events() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        gdb.reply(
            "=thread-created,id=\"3\",group-id=\"i1\"\n=thread-selected,id=\"3\"\n=thread-exited,id=\"3\",group-id=\"i1\"\n=thread-group-exited,id=\"i1\",exit-code=\"0\"\n=library-loaded,id=\"/lib/x.so\"\n",
        )
        .await;

        assert_eq!(
            next_event(&mut events).await,
            MiEvent::ThreadCreated {
                thread_id: 3,
                group_id: "i1".to_string()
            }
        );
        assert_eq!(next_event(&mut events).await, MiEvent::ThreadSelected { thread_id: 3 });
        assert_eq!(
            next_event(&mut events).await,
            MiEvent::ThreadExited {
                thread_id: 3,
                group_id: "i1".to_string()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            MiEvent::ThreadGroupExited {
                group_id: "i1".to_string(),
                exit_code: Some("0".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_plain_text_and_prompt() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        gdb.reply("(gdb) \nHello, world\n").await;
        assert_eq!(
            next_event(&mut events).await,
            MiEvent::msg(MsgKind::Stdout, "Hello, world")
        );
    }

    #[tokio::test]
    async fn test_exit_fails_pending_and_later_sends() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("exec-interrupt").await }
        });
        gdb.next_command().await;
        gdb.hang_up().await;

        assert_eq!(task.await.unwrap(), Err(MiError::Exited));
        assert_eq!(next_non_msg(&mut events).await, MiEvent::Quit);
        assert!(session.has_exited());
        assert_eq!(session.status(), SessionStatus::None);
        assert!(matches!(session.send("gdb-version").await, Err(MiError::Transport(_))));
    }

    #[tokio::test]
    async fn test_send_without_transport_is_transport_error() {
        let session = MiSession::new(GdbConfig::default());
        assert!(matches!(session.send("gdb-version").await, Err(MiError::Transport(_))));
    }

    #[tokio::test]
    async fn test_initialize_reads_version() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.initialize(&["gdb-set confirm off".to_string()]).await }
        });
        gdb.answer("gdb-set target-async on", "").await;
        let line = gdb.next_command().await;
        assert_eq!(line, "2-gdb-version");
        gdb.reply("~\"GNU gdb (GNU Arm Embedded Toolchain 10.3-2021.10) 10.2.90.20210621-git\\n\"\n2^done\n")
            .await;
        gdb.answer("gdb-set confirm off", "").await;

        assert_ok!(task.await.unwrap());
        assert_eq!(session.version(), Some(GdbVersion { major: 10, minor: 2 }));
    }

    #[tokio::test]
    async fn test_initialize_rejects_old_gdb() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.initialize(&["gdb-set confirm off".to_string()]).await }
        });
        // target-async may fail on old debuggers
        let line = gdb.next_command().await;
        assert_eq!(line, "1-gdb-set target-async on");
        gdb.reply("1^error,msg=\"unknown\"\n").await;
        gdb.next_command().await;
        gdb.reply("~\"GNU gdb (GDB) 8.1\\n\"\n2^done\n").await;

        let err = assert_err!(task.await.unwrap());
        assert!(matches!(err, MiError::Startup(_)));
    }

    #[tokio::test]
    async fn test_initialize_times_out() {
        let config = GdbConfig {
            startup_timeout_ms: 50,
            ..GdbConfig::default()
        };
        let (session, _gdb) = connected(config).await;
        let err = assert_err!(session.initialize(&[]).await);
        assert!(matches!(err, MiError::Startup(_)));
    }

    #[tokio::test]
    async fn test_initialize_rejects_old_gdb_with_bare_vendor_banner() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.initialize(&[]).await }
        });
        gdb.answer("gdb-set target-async on", "").await;
        gdb.next_command().await;
        gdb.reply("~\"GNU gdb (GDB) Red Hat Enterprise Linux 8.2-20.el8\\n\"\n2^done\n")
            .await;

        let err = assert_err!(task.await.unwrap());
        assert!(matches!(err, MiError::Startup(_)));
    }

    #[tokio::test]
    async fn test_abandoned_capture_releases_console() {
        let config = GdbConfig {
            startup_timeout_ms: 100,
            ..GdbConfig::default()
        };
        let (session, mut gdb) = connected(config).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.initialize(&[]).await }
        });
        gdb.answer("gdb-set target-async on", "").await;
        assert_eq!(gdb.next_command().await, "2-gdb-version");
        // gdb-version is never answered
        let err = assert_err!(task.await.unwrap());
        assert!(matches!(err, MiError::Startup(_)));
        {
            let state = session.shared.state.lock();
            assert!(state.pending.is_empty());
            assert!(state.capture.is_none());
        }

        let mut events = session.subscribe();
        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("thread-info").await }
        });
        assert_eq!(gdb.next_command().await, "3-thread-info");
        gdb.reply("~\"  Id   Target Id\\n\"\n3^done\n").await;

        assert_ok!(task.await.unwrap());
        assert_eq!(
            next_event(&mut events).await,
            MiEvent::msg(MsgKind::Console, "  Id   Target Id\n")
        );
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told_how_much_it_missed() {
        let config = GdbConfig {
            event_capacity: 2,
            ..GdbConfig::default()
        };
        let (session, mut gdb) = connected(config).await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("thread-info").await }
        });
        gdb.next_command().await;
        gdb.reply("@\"a\"\n@\"b\"\n@\"c\"\n@\"d\"\n1^done\n").await;
        assert_ok!(task.await.unwrap());

        assert!(matches!(events.recv().await, Err(broadcast::error::RecvError::Lagged(2))));
        assert_eq!(next_event(&mut events).await, MiEvent::msg(MsgKind::Target, "c"));
        assert_eq!(next_event(&mut events).await, MiEvent::msg(MsgKind::Target, "d"));
    }

    #[tokio::test]
    async fn test_stop_is_graceful_and_idempotent() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;
        let mut events = session.subscribe();

        let stopper = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.stop().await }
        });
        gdb.answer("target-disconnect", "").await;
        assert_eq!(gdb.next_command().await, "-gdb-exit");
        // A second stop while the first is running returns at once
        assert_ok!(session.stop().await);
        gdb.hang_up().await;

        assert_ok!(stopper.await.unwrap());
        assert_eq!(next_non_msg(&mut events).await, MiEvent::Quit);
        assert!(session.has_exited());
    }

    #[tokio::test]
    async fn test_stop_forces_exit_when_debugger_hangs() {
        let config = GdbConfig {
            disconnect_timeout_ms: 20,
            exit_timeout_ms: 20,
            ..GdbConfig::default()
        };
        let (session, _gdb) = connected(config).await;
        assert_ok!(session.stop().await);
        assert!(session.has_exited());
    }

    #[tokio::test]
    async fn test_send_user_input() {
        let (session, mut gdb) = connected(GdbConfig::default()).await;

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session.send_user_input("-break-list").await?;
                session.send_user_input("print \"hi\"").await
            }
        });
        gdb.answer("break-list", "").await;
        gdb.answer("interpreter-exec console \"print \\\"hi\\\"\"", "").await;
        assert_ok!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_debug_output_echo() {
        let config = GdbConfig {
            debug_output: DebugOutput::Raw,
            ..GdbConfig::default()
        };
        let (session, mut gdb) = connected(config).await;
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("thread-info").await }
        });
        gdb.answer("thread-info", "").await;
        assert_ok!(task.await.unwrap());

        assert_eq!(next_event(&mut events).await, MiEvent::msg(MsgKind::Log, "1-thread-info\n"));
        assert_eq!(next_event(&mut events).await, MiEvent::msg(MsgKind::Log, "-> 1^done"));
        match next_event(&mut events).await {
            MiEvent::Msg { kind, text } => {
                assert_eq!(kind, MsgKind::Log);
                assert!(text.starts_with("GDB -> App: {"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
