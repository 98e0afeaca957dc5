//! GDB Machine Interface (MI) Parser
//!
//! Parses GDB/MI output lines into [`MiNode`]s.
//!
//! ```text
//! output ==> ( out-of-band-record )* [ result-record ] "(gdb)"
//! out-of-band-record := [token] ("*" | "+" | "=") class ( "," variable "=" value )*
//!                     | ("~" | "@" | "&") c-string
//! result-record      := [token] "^" ("done" | "running" | "connected" | "error" | "exit")
//!                       ( "," variable "=" value )*
//! value              := c-string | tuple | list
//! ```

use crate::gdb::error::{MiError, Result};
use crate::gdb::types::*;
use regex::Regex;
use tracing::debug;

/// Position inside the line being parsed.
///
/// Every advance lands on an ASCII byte or a regex match boundary, so `rest()`
/// always slices at a char boundary.
struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn next_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.input.len());
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_newline(&mut self) {
        self.eat(b'\r');
        self.eat(b'\n');
    }

    /// Three octal digits starting at the cursor
    fn octal_triple(&self) -> Option<u32> {
        let digits = self.input.as_bytes().get(self.pos..self.pos + 3)?;
        if !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
            return None;
        }
        Some(digits.iter().fold(0, |acc, d| acc * 8 + u32::from(d - b'0')))
    }
}

/// GDB/MI Parser
pub struct MiParser {
    out_of_band_pattern: Regex,
    result_pattern: Regex,
    variable_pattern: Regex,
    // Recognizers used before parsing
    non_output_pattern: Regex,
    prompt_pattern: Regex,
    banner_pattern: Regex,
    // Vendor text between `GNU gdb` and the version that is not in parentheses
    loose_banner_pattern: Regex,
}

impl MiParser {
    pub fn new() -> Self {
        Self {
            // Async record (*, +, =) with optional token, or stream record (~, @, &)
            out_of_band_pattern: Regex::new(r"^(?:([0-9]*)([*+=])|([~@&]))").expect("valid regex"),
            // Result record: ^done, ^error, ^running, etc.
            result_pattern: Regex::new(r"^([0-9]*)\^(done|running|connected|error|exit)")
                .expect("valid regex"),
            variable_pattern: Regex::new(r"^[a-zA-Z_\-][a-zA-Z0-9_\-]*").expect("valid regex"),
            non_output_pattern: Regex::new(r"^[0-9]*[*+=~@&^]").expect("valid regex"),
            prompt_pattern: Regex::new(r"^\s*[0-9]*\(gdb\)\s*$").expect("valid regex"),
            banner_pattern: Regex::new(r"(?m)^GNU gdb\s(?:\(.*\)\s?)?(\d+)\.(\d+)").expect("valid regex"),
            loose_banner_pattern: Regex::new(r"(?m)^GNU gdb\s.*?(\d+)\.(\d+)").expect("valid regex"),
        }
    }

    /// True when `line` is plain text (program output, banners) rather than
    /// MI protocol
    pub fn could_be_output(&self, line: &str) -> bool {
        !self.non_output_pattern.is_match(line)
    }

    /// True for the `(gdb)` prompt that terminates each batch of output
    pub fn is_prompt(&self, line: &str) -> bool {
        self.prompt_pattern.is_match(line)
    }

    /// Parse the version from the console text printed by `gdb-version`;
    /// also returns where the banner starts
    pub fn parse_version_banner(&self, text: &str) -> Option<(GdbVersion, usize)> {
        let caps = self
            .banner_pattern
            .captures(text)
            .or_else(|| self.loose_banner_pattern.captures(text))?;
        let version = GdbVersion {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
        };
        Some((version, caps.get(0)?.start()))
    }

    /// Parse a single line of GDB/MI output
    pub fn parse_line(&self, line: &str) -> Result<MiNode> {
        let mut node = MiNode::default();
        if line.trim().is_empty() || self.is_prompt(line) {
            return Ok(node);
        }

        let mut cur = Cursor::new(line);

        while let Some(caps) = self.out_of_band_pattern.captures(cur.rest()) {
            cur.advance(caps[0].len());
            if let Some(token) = caps.get(1) {
                Self::take_token(&mut node, token.as_str());
            }

            if let Some(marker) = caps.get(2) {
                let kind = AsyncKind::from_marker(marker.as_str().as_bytes()[0])
                    .ok_or_else(|| MiError::Protocol(line.to_string()))?;
                let rest = cur.rest();
                let class_end = rest.find(',').unwrap_or(rest.len());
                let class = rest[..class_end].trim_end().to_string();
                cur.advance(class_end);
                let output = self.parse_comma_results(&mut cur);
                node.out_of_band.push(OutOfBandRecord::Async { kind, class, output });
            } else if let Some(marker) = caps.get(3) {
                let kind = StreamKind::from_marker(marker.as_str().as_bytes()[0])
                    .ok_or_else(|| MiError::Protocol(line.to_string()))?;
                let content = Self::parse_c_string(&mut cur).unwrap_or_default();
                node.out_of_band.push(OutOfBandRecord::Stream { kind, content });
            }

            cur.skip_newline();
        }

        if let Some(caps) = self.result_pattern.captures(cur.rest()) {
            cur.advance(caps[0].len());
            Self::take_token(&mut node, &caps[1]);
            let class = ResultClass::from_name(&caps[2])
                .ok_or_else(|| MiError::Protocol(line.to_string()))?;
            let results = self.parse_comma_results(&mut cur);
            node.result_record = Some(ResultRecord { class, results });
            cur.skip_newline();
        }

        if node.out_of_band.is_empty() && node.result_record.is_none() {
            return Err(MiError::Protocol(line.to_string()));
        }
        if !cur.rest().trim().is_empty() {
            debug!("Ignoring trailing MI text: {}", cur.rest());
        }

        Ok(node)
    }

    /// The first token on a line wins
    fn take_token(node: &mut MiNode, digits: &str) {
        if node.token.is_none() && !digits.is_empty() {
            node.token = digits.parse().ok();
        }
    }

    /// Parse a c-string starting at the opening quote.
    ///
    /// Bytes are collected first and decoded at the end, so octal escapes that
    /// spell out a multi-byte UTF-8 sequence come back as one character.
    fn parse_c_string(cur: &mut Cursor<'_>) -> Option<String> {
        if !cur.eat(b'"') {
            return None;
        }

        let mut bytes = Vec::new();
        while let Some(b) = cur.next_byte() {
            match b {
                b'"' => break,
                b'\\' => {
                    if let Some(code) = cur.octal_triple() {
                        if let Ok(byte) = u8::try_from(code) {
                            bytes.push(byte);
                        } else {
                            bytes.push(b'\\');
                            bytes.extend_from_slice(&cur.rest().as_bytes()[..3]);
                        }
                        cur.advance(3);
                        continue;
                    }
                    match cur.next_byte() {
                        Some(b'n') => bytes.push(b'\n'),
                        Some(b'r') => bytes.push(b'\r'),
                        Some(b't') => bytes.push(b'\t'),
                        Some(b'b') => bytes.push(0x08),
                        Some(b'f') => bytes.push(0x0c),
                        Some(b'v') => bytes.push(0x0b),
                        Some(b'0') => bytes.push(0),
                        Some(c @ (b'\\' | b'"' | b'\'')) => bytes.push(c),
                        Some(other) => {
                            bytes.push(b'\\');
                            bytes.push(other);
                        }
                        None => bytes.push(b'\\'),
                    }
                }
                other => bytes.push(other),
            }
        }

        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Parse `("," variable "=" value)*`
    fn parse_comma_results(&self, cur: &mut Cursor<'_>) -> Vec<MiResult> {
        let mut results = Vec::new();
        loop {
            let mark = cur.pos;
            if !cur.eat(b',') {
                break;
            }
            match self.parse_result(cur) {
                Some(result) => results.push(result),
                None => {
                    cur.pos = mark;
                    break;
                }
            }
        }
        results
    }

    /// Parse a single result (variable=value)
    fn parse_result(&self, cur: &mut Cursor<'_>) -> Option<MiResult> {
        let name = self.variable_pattern.find(cur.rest())?.as_str();
        cur.advance(name.len());
        cur.eat(b'=');
        let value = self.parse_value(cur).unwrap_or(MiValue::Empty);
        Some(MiResult::new(name, value))
    }

    /// Parse a value (string, list, or tuple)
    fn parse_value(&self, cur: &mut Cursor<'_>) -> Option<MiValue> {
        match cur.peek()? {
            b'"' => Self::parse_c_string(cur).map(MiValue::Const),
            b'{' | b'[' => self.parse_tuple_or_list(cur),
            _ => None,
        }
    }

    /// Parse `{...}` or `[...]`.
    ///
    /// A `[` list is tried as a value list first and falls back to a result
    /// list; GDB is not strict about which bracket it uses for named entries.
    fn parse_tuple_or_list(&self, cur: &mut Cursor<'_>) -> Option<MiValue> {
        let start = cur.pos;
        let is_list = cur.next_byte()? == b'[';

        if matches!(cur.peek(), Some(b'}' | b']')) {
            cur.advance(1);
            return Some(if is_list {
                MiValue::List(Vec::new())
            } else {
                MiValue::Tuple(Vec::new())
            });
        }

        if is_list {
            if let Some(first) = self.parse_value(cur) {
                let mut values = vec![first];
                loop {
                    let mark = cur.pos;
                    if !cur.eat(b',') {
                        break;
                    }
                    match self.parse_value(cur) {
                        Some(value) => values.push(value),
                        None => {
                            cur.pos = mark;
                            break;
                        }
                    }
                }
                Self::close_bracket(cur);
                return Some(MiValue::List(values));
            }
        }

        if let Some(first) = self.parse_result(cur) {
            let mut results = vec![first];
            results.extend(self.parse_comma_results(cur));
            Self::close_bracket(cur);
            return Some(if is_list {
                MiValue::ResultList(results)
            } else {
                MiValue::Tuple(results)
            });
        }

        cur.pos = start;
        None
    }

    fn close_bracket(cur: &mut Cursor<'_>) {
        if matches!(cur.peek(), Some(b'}' | b']')) {
            cur.advance(1);
        }
    }
}

impl Default for MiParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse frame from a `frame={...}` tuple
pub fn parse_frame(value: &MiValue) -> Option<Frame> {
    let text = |key: &str| value.value_of(key).and_then(|v| v.as_str().map(str::to_string));
    Some(Frame {
        level: text("level").and_then(|s| s.parse().ok()).unwrap_or(0),
        addr: text("addr")?,
        func: text("func"),
        file: text("file"),
        fullname: text("fullname"),
        line: text("line").and_then(|s| s.parse().ok()),
        from: text("from"),
    })
}

/// Parse stack frames from stack-list-frames response
pub fn parse_stack_frames(node: &MiNode) -> Vec<Frame> {
    let Some(MiValue::ResultList(stack) | MiValue::Tuple(stack)) = node.result("stack") else {
        return Vec::new();
    };
    stack
        .iter()
        .filter_map(|element| element.value_of("@frame"))
        .filter_map(|frame| parse_frame(&frame))
        .collect()
}

/// Parse locals from stack-list-variables response
pub fn parse_stack_variables(node: &MiNode) -> Vec<StackVariable> {
    let Some(MiValue::List(variables)) = node.result("variables") else {
        return Vec::new();
    };
    variables
        .iter()
        .filter_map(|element| {
            let text = |key: &str| element.value_of(key).and_then(|v| v.as_str().map(str::to_string));
            Some(StackVariable {
                name: text("name")?,
                value: text("value"),
                var_type: text("type"),
            })
        })
        .collect()
}
