//! High-level GDB operations relayed over an [`MiSession`]

use crate::gdb::error::{MiError, Result};
use crate::gdb::events::MsgKind;
use crate::gdb::parser::{parse_frame, parse_stack_frames, parse_stack_variables};
use crate::gdb::session::MiSession;
use crate::gdb::types::*;
use crate::gdb::varobj::VariableObject;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `--thread N --frame M`, each part only when given
pub fn thread_frame_args(thread: Option<u64>, frame: Option<u64>) -> String {
    let mut parts = Vec::new();
    if let Some(thread) = thread {
        parts.push(format!("--thread {}", thread));
    }
    if let Some(frame) = frame {
        parts.push(format!("--frame {}", frame));
    }
    parts.join(" ")
}

/// Join non-empty command pieces with single spaces
fn command(pieces: &[&str]) -> String {
    pieces
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a trailing `,x`-style display format off an expression
fn split_format(expression: &str) -> (&str, Option<&'static str>) {
    let bytes = expression.as_bytes();
    if bytes.len() < 2 || bytes[bytes.len() - 2] != b',' {
        return (expression, None);
    }
    let format = match bytes[bytes.len() - 1].to_ascii_lowercase() {
        b'b' => "binary",
        b'd' => "decimal",
        b'h' | b'x' => "hexadecimal",
        b'o' => "octal",
        b'n' => "natural",
        _ => return (expression, None),
    };
    (&expression[..expression.len() - 2], Some(format))
}

/// Escape `\` and `"` for a quoted MI argument
pub(crate) fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `break-insert`/`break-watch` flags for a hit count condition: `>N` ignores
/// the first N hits, `N` breaks once after N. `None` when the condition is
/// neither.
fn count_condition_args(condition: &str) -> Option<String> {
    let leading_number = |text: &str| {
        let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
        (!digits.is_empty()).then_some(digits)
    };

    if let Some(rest) = condition.strip_prefix('>') {
        return leading_number(rest).map(|n| format!("-i {} ", n));
    }
    let digits = leading_number(condition)?;
    if digits.len() != condition.len() {
        return None;
    }
    match digits.parse::<u64>() {
        Ok(0) => Some(String::new()),
        Ok(n) => Some(format!("-t -i {} ", n)),
        Err(_) => None,
    }
}

fn expect_running(node: &MiNode) -> bool {
    node.result_class() == Some(ResultClass::Running)
}

impl MiSession {
    /// Interrupt the target; true when GDB answered `^done`
    pub async fn interrupt(&self, args: &str) -> Result<bool> {
        let node = self.send(&command(&["exec-interrupt", args])).await?;
        Ok(node.result_class() == Some(ResultClass::Done))
    }

    pub async fn continue_execution(&self, thread_id: u64) -> Result<bool> {
        let node = self
            .send(&format!("exec-continue --thread {}", thread_id))
            .await?;
        Ok(expect_running(&node))
    }

    pub async fn next(&self, thread_id: u64, instruction: bool) -> Result<bool> {
        let base = if instruction { "exec-next-instruction" } else { "exec-next" };
        let node = self.send(&format!("{} --thread {}", base, thread_id)).await?;
        Ok(expect_running(&node))
    }

    pub async fn step(&self, thread_id: u64, instruction: bool) -> Result<bool> {
        let base = if instruction { "exec-step-instruction" } else { "exec-step" };
        let node = self.send(&format!("{} --thread {}", base, thread_id)).await?;
        Ok(expect_running(&node))
    }

    pub async fn step_out(&self, thread_id: u64) -> Result<bool> {
        let node = self
            .send(&format!("exec-finish --thread {}", thread_id))
            .await?;
        Ok(expect_running(&node))
    }

    pub async fn evaluate_expression(
        &self,
        expression: &str,
        thread: Option<u64>,
        frame: Option<u64>,
    ) -> Result<MiNode> {
        let selectors = thread_frame_args(thread, frame);
        self.send(&command(&["data-evaluate-expression", &selectors, expression]))
            .await
    }

    pub async fn get_frame(&self, thread: u64, frame: u64) -> Result<Frame> {
        let cmd = format!("stack-info-frame --thread {} --frame {}", thread, frame);
        let node = self.send(&cmd).await?;
        node.result("frame")
            .as_ref()
            .and_then(parse_frame)
            .ok_or_else(|| MiError::Protocol(format!("no frame in reply to {}", cmd)))
    }

    pub async fn get_stack_depth(&self, thread: u64) -> Result<u64> {
        let cmd = format!("stack-info-depth --thread {} 10000", thread);
        let node = self.send(&cmd).await?;
        node.result_str("depth")
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| MiError::Protocol(format!("no depth in reply to {}", cmd)))
    }

    pub async fn get_stack(&self, thread: u64, start_level: u64, max_levels: u64) -> Result<Vec<Frame>> {
        let node = self
            .send(&format!(
                "stack-list-frames --thread {} {} {}",
                thread, start_level, max_levels
            ))
            .await?;
        Ok(parse_stack_frames(&node))
    }

    pub async fn get_stack_variables(&self, thread: u64, frame: u64) -> Result<Vec<StackVariable>> {
        let node = self
            .send(&format!(
                "stack-list-variables --thread {} --frame {} --simple-values",
                thread, frame
            ))
            .await?;
        Ok(parse_stack_variables(&node))
    }

    /// Create a variable object. A trailing `,x` (or `,d`, `,o`, `,b`, `,h`,
    /// `,n`) picks its display format; that needs a named object.
    pub async fn var_create(
        &self,
        parent: u32,
        expression: &str,
        name: Option<&str>,
        scope: Option<&str>,
    ) -> Result<VariableObject> {
        let name = name.unwrap_or("-");
        let scope = scope.unwrap_or("@");
        let (expression, format) = split_format(expression.trim());
        let quoted = expression.replace('"', "\\\"");

        let created = self
            .send(&format!("var-create {} {} \"{}\"", name, scope, quoted))
            .await?;

        let mut value_override = None;
        if let Some(format) = format.filter(|_| name != "-") {
            let formatted = self
                .send(&format!("var-set-format {} {}", name, format))
                .await?;
            value_override = formatted.result_str("value");
        }

        let results = created
            .result_record
            .map(|record| record.results)
            .unwrap_or_default();
        let mut object = VariableObject::from_results(parent, &results);
        if object.exp.is_empty() {
            object.exp = expression.to_string();
        }
        if let Some(value) = value_override {
            object.value = value;
        }
        Ok(object)
    }

    pub async fn var_evaluate(&self, name: &str) -> Result<MiNode> {
        self.send(&format!("var-evaluate-expression {}", name)).await
    }

    /// Children of `name`; `<anonymous ...>` members are replaced by their own
    /// children when `flatten_anonymous` is set
    pub fn var_list_children<'a>(
        &'a self,
        parent: u32,
        name: &'a str,
        flatten_anonymous: bool,
    ) -> BoxFuture<'a, Result<Vec<VariableObject>>> {
        Box::pin(async move {
            let node = self
                .send(&format!("var-list-children --all-values {}", name))
                .await?;

            let mut children = Vec::new();
            let Some(listed) = node.result("children") else {
                return Ok(children);
            };
            for entry in listed.as_results().unwrap_or_default() {
                let Some(fields) = entry.value.as_results() else {
                    continue;
                };
                let child = VariableObject::from_results(parent, fields);
                if flatten_anonymous && child.exp.starts_with("<anonymous ") {
                    debug!("Flattening {}", child.name);
                    children.extend(
                        self.var_list_children(parent, &child.name, flatten_anonymous)
                            .await?,
                    );
                } else {
                    children.push(child);
                }
            }
            Ok(children)
        })
    }

    /// `var-update --all-values`; `None` updates every object
    pub async fn var_update(&self, name: Option<&str>, thread: Option<u64>, frame: Option<u64>) -> Result<MiNode> {
        let selectors = thread_frame_args(thread, frame);
        self.send(&command(&["var-update", &selectors, "--all-values", name.unwrap_or("*")]))
            .await
    }

    pub async fn var_assign(
        &self,
        name: &str,
        raw_value: &str,
        thread: Option<u64>,
        frame: Option<u64>,
    ) -> Result<MiNode> {
        let selectors = thread_frame_args(thread, frame);
        self.send(&command(&["var-assign", &selectors, name, raw_value]))
            .await
    }

    pub async fn var_delete(&self, name: &str) -> Result<MiNode> {
        self.send(&format!("var-delete {}", name)).await
    }

    pub async fn change_variable(&self, name: &str, raw_value: &str) -> Result<MiNode> {
        self.send(&format!("gdb-set var {}={}", name, raw_value)).await
    }

    fn count_args(&self, condition: Option<&str>) -> String {
        let Some(condition) = condition.filter(|c| !c.is_empty()) else {
            return String::new();
        };
        count_condition_args(condition).unwrap_or_else(|| {
            warn!("Unsupported break count expression: {}", condition);
            self.log(
                MsgKind::Stderr,
                format!(
                    "Unsupported break count expression: '{}'. Only supports 'X' for breaking once after X times or '>X' for ignoring the first X breaks\n",
                    condition
                ),
            );
            "-t ".to_string()
        })
    }

    /// Insert `breakpoint` and fill in the number, line and file GDB reports
    pub async fn add_breakpoint(&self, mut breakpoint: Breakpoint) -> Result<Breakpoint> {
        let mut args = self.count_args(breakpoint.count_condition.as_deref());
        if let Some(condition) = breakpoint.condition.as_deref().filter(|c| !c.is_empty()) {
            args.push_str(&format!("-c \"{}\" ", condition));
        }
        match &breakpoint.raw {
            Some(raw) => args.push_str(&format!("*{}", escape(raw))),
            None => args.push_str(&format!(
                "\"{}:{}\"",
                escape(breakpoint.file.as_deref().unwrap_or_default()),
                breakpoint.line.map(|l| l.to_string()).unwrap_or_default()
            )),
        }

        let node = self.send(&format!("break-insert {}", args)).await?;
        if node.result_class() != Some(ResultClass::Done) {
            return Err(MiError::Command {
                message: node.result_str("msg").unwrap_or_else(|| "Internal error".to_string()),
                command: format!("Setting breakpoint at {}", args),
            });
        }

        breakpoint.number = node.result_str("bkpt.number").and_then(|n| n.parse().ok());
        if let Some(line) = node.result_str("bkpt.line").and_then(|l| l.parse().ok()) {
            breakpoint.line = Some(line);
        }
        if breakpoint.file.is_none() {
            breakpoint.file = node
                .result_str("bkpt.fullname")
                .or_else(|| node.result_str("bkpt.file"));
        }
        Ok(breakpoint)
    }

    /// Insert a watchpoint; if its condition is rejected the watchpoint is
    /// deleted again and the error returned
    pub async fn add_data_breakpoint(&self, mut breakpoint: DataBreakpoint) -> Result<DataBreakpoint> {
        let args = format!(
            "{}{}",
            self.count_args(breakpoint.count_condition.as_deref()),
            breakpoint.exp
        );
        let access = match breakpoint.access {
            WatchpointType::Write => "",
            WatchpointType::Read => "-r",
            WatchpointType::Access => "-a",
        };

        let node = self.send(&command(&["break-watch", access, &args])).await?;
        if node.result_class() != Some(ResultClass::Done) {
            return Err(MiError::Command {
                message: node.result_str("msg").unwrap_or_else(|| "Internal error".to_string()),
                command: format!("Setting breakpoint at {}", args),
            });
        }
        let number: u64 = node
            .result_str("bkpt.number")
            .or_else(|| node.result_str("wpt.number"))
            .or_else(|| node.result_str("hw-rwpt.number"))
            .or_else(|| node.result_str("hw-awpt.number"))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| MiError::Protocol("no number in break-watch reply".to_string()))?;
        breakpoint.number = Some(number);

        if let Some(condition) = breakpoint.condition.as_deref().filter(|c| !c.is_empty()) {
            let outcome = self
                .send(&format!("break-condition {} {}", number, condition))
                .await;
            match outcome {
                Ok(node) if node.result_class() == Some(ResultClass::Done) => {}
                Ok(node) => {
                    return Err(MiError::Command {
                        message: node.result_str("msg").unwrap_or_else(|| "Internal error".to_string()),
                        command: "Setting breakpoint condition".to_string(),
                    })
                }
                Err(e) => {
                    if let Err(delete) = self.send(&format!("break-delete {}", number)).await {
                        debug!("Failed to delete watchpoint {}: {}", number, delete);
                    }
                    return Err(e);
                }
            }
        }
        Ok(breakpoint)
    }

    /// Delete breakpoints by number; nothing to delete counts as success
    pub async fn remove_breakpoints(&self, numbers: &[u64]) -> Result<bool> {
        if numbers.is_empty() {
            return Ok(true);
        }
        let numbers: Vec<String> = numbers.iter().map(u64::to_string).collect();
        let node = self.send(&format!("break-delete {}", numbers.join(" "))).await?;
        Ok(node.result_class() == Some(ResultClass::Done))
    }

    /// Hex contents of `length` bytes of target memory at `from`
    pub async fn examine_memory(&self, from: u64, length: u64) -> Result<Option<String>> {
        let node = self
            .send(&format!("data-read-memory-bytes 0x{:x} {}", from, length))
            .await?;
        Ok(node.result_str("memory[0].contents"))
    }

    /// Move execution to `file:line` through a temporary breakpoint there
    pub async fn goto(&self, file: Option<&str>, line: u64) -> Result<bool> {
        let target = match file {
            Some(file) => format!("\"{}:{}\"", escape(file), line),
            None => format!("\"{}\"", line),
        };
        self.send(&format!("break-insert -t {}", target)).await?;
        let node = self.send(&format!("exec-jump {}", target)).await?;
        Ok(expect_running(&node))
    }

    /// Send `commands` one after another, stopping at the first failure
    pub async fn run_sequence(&self, commands: &[String]) -> Result<()> {
        for command in commands {
            self.send(command).await?;
        }
        Ok(())
    }
}
