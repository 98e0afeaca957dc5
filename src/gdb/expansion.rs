//! Expansion of values printed as plain text
//!
//! Some backends answer with the debugger's console rendering of a value
//! rather than MI structure:
//!
//! ```text
//! {quit = false, _views = {{view = 0x7ffff7ece1e8}}, _start = {callbacks = 0x0}}
//! ```
//!
//! [`ValueExpander`] turns that into named leaves. Anything that can be looked
//! into further (structs, arrays, pointers, references, elided `{...}`) is
//! handed to a registration callback, which returns the reference number the
//! caller wants to use for it.

use regex::Regex;

/// One member or element of an expanded value
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedVariable {
    pub name: String,
    pub value: String,
    /// 0 for plain values
    pub reference: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expanded {
    Scalar(String),
    Compound(Vec<ExpandedVariable>),
}

/// Something the caller is asked to register for later expansion
#[derive(Debug, Clone, PartialEq)]
pub enum ExpansionTarget {
    /// Members already parsed out of the text
    Compound(Vec<ExpandedVariable>),
    /// Expression for what a pointer or reference points at, e.g. `*s.next`
    Pointee(String),
    /// Expression of a value whose contents the debugger elided
    Elided(String),
}

/// Quick classification of a printed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expandable {
    Scalar,
    Object,
    Reference,
}

pub struct ValueExpander {
    result_pattern: Regex,
    bool_pattern: Regex,
    null_pattern: Regex,
    ref_string_pattern: Regex,
    reference_pattern: Regex,
    cpp_ref_pattern: Regex,
    char_pattern: Regex,
    number_pattern: Regex,
    variable_pattern: Regex,
    error_pattern: Regex,
}

impl ValueExpander {
    pub fn new() -> Self {
        Self {
            result_pattern: Regex::new(r"^([a-zA-Z_\-][a-zA-Z0-9_\-]*|\[\d+\])\s*=\s*")
                .expect("valid regex"),
            bool_pattern: Regex::new(r"^(?:true|false)\b").expect("valid regex"),
            null_pattern: Regex::new(r"^0x0+\b").expect("valid regex"),
            ref_string_pattern: Regex::new(r#"^(0x[0-9a-fA-F]+\s*)["']"#).expect("valid regex"),
            reference_pattern: Regex::new(r"^0x[0-9a-fA-F]+").expect("valid regex"),
            cpp_ref_pattern: Regex::new(r"^@0x[0-9a-fA-F]+").expect("valid regex"),
            char_pattern: Regex::new(r#"^(-?\d+) ['"]"#).expect("valid regex"),
            number_pattern: Regex::new(r"^-?\d+(?:\.\d+)?").expect("valid regex"),
            variable_pattern: Regex::new(r"^[a-zA-Z_\-][a-zA-Z0-9_\-]*").expect("valid regex"),
            error_pattern: Regex::new(r"^<.+?>").expect("valid regex"),
        }
    }

    pub fn is_expandable(&self, value: &str) -> Expandable {
        let value = value.trim();
        if value.starts_with('{') {
            Expandable::Object
        } else if self.null_pattern.is_match(value) || self.ref_string_pattern.is_match(value) {
            Expandable::Scalar
        } else if self.reference_pattern.is_match(value) || self.cpp_ref_pattern.is_match(value) {
            Expandable::Reference
        } else {
            Expandable::Scalar
        }
    }

    /// Parse `value`, naming nested pointer targets relative to `root`.
    /// `register` is called for every expandable leaf, innermost first.
    pub fn expand<F>(&self, value: &str, root: &str, register: F) -> Option<Expanded>
    where
        F: FnMut(ExpansionTarget) -> u32,
    {
        // `{...}` is not a tuple, keep it away from the tuple parser
        let text = value.replace("{...}", "<...>");
        let mut expansion = Expansion {
            patterns: self,
            rest: text.trim(),
            root,
            stack: Vec::new(),
            register,
        };
        expansion.parse_value()
    }
}

impl Default for ValueExpander {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one `expand` call
struct Expansion<'a, F> {
    patterns: &'a ValueExpander,
    rest: &'a str,
    root: &'a str,
    /// Names of the members enclosing the current position
    stack: Vec<String>,
    register: F,
}

impl<'a, F> Expansion<'a, F>
where
    F: FnMut(ExpansionTarget) -> u32,
{
    fn advance(&mut self, n: usize) {
        self.rest = self.rest[n..].trim_start();
    }

    fn eat(&mut self, c: char) -> bool {
        self.rest = self.rest.trim_start();
        if self.rest.starts_with(c) {
            self.advance(c.len_utf8());
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Option<Expanded> {
        self.rest = self.rest.trim_start();
        match self.rest.chars().next()? {
            '"' | '\'' => self.parse_c_string().map(Expanded::Scalar),
            '{' => self.parse_tuple_or_list(),
            _ => self.parse_primitive().map(Expanded::Scalar),
        }
    }

    /// Quoted string, returned with its quotes. An unterminated string runs
    /// to the end of the input.
    fn parse_c_string(&mut self) -> Option<String> {
        let quote = self.rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let mut escaped = false;
        let mut end = self.rest.len();
        for (i, c) in self.rest.char_indices().skip(1) {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                end = i + c.len_utf8();
                break;
            }
        }
        let text = self.rest[..end].trim().to_string();
        self.advance(end);
        Some(text)
    }

    /// A value list when there is no `=` at all, or a `,` or `{` comes before
    /// the first one
    fn is_value_list(&self) -> bool {
        let Some(eq) = self.rest.find('=') else {
            return true;
        };
        let next_value = match (self.rest.find('{'), self.rest.find(',')) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        next_value.is_some_and(|pos| eq > pos)
    }

    fn parse_tuple_or_list(&mut self) -> Option<Expanded> {
        if !self.eat('{') {
            return None;
        }
        if self.eat('}') {
            return Some(Expanded::Compound(Vec::new()));
        }

        if self.is_value_list() {
            let mut values = Vec::new();
            loop {
                let index = format!("[{}]", values.len());
                self.stack.push(index.clone());
                let value = self.parse_value();
                self.stack.pop();
                let Some(value) = value else {
                    break;
                };
                values.push(self.create_value(&index, value));
                if !self.eat(',') {
                    break;
                }
            }
            self.eat('}');
            return Some(Expanded::Compound(values));
        }

        let mut results = vec![self.parse_result()?];
        while self.eat(',') {
            match self.parse_result() {
                Some(result) => results.push(result),
                None => break,
            }
        }
        self.eat('}');
        Some(Expanded::Compound(results))
    }

    fn parse_result(&mut self) -> Option<ExpandedVariable> {
        self.rest = self.rest.trim_start();
        let caps = self.patterns.result_pattern.captures(self.rest)?;
        let name = caps[1].to_string();
        let len = caps[0].len();
        self.advance(len);

        self.stack.push(name.clone());
        let value = self.parse_value();
        self.stack.pop();

        let value = value.unwrap_or_else(|| Expanded::Scalar(String::new()));
        Some(self.create_value(&name, value))
    }

    fn parse_primitive(&mut self) -> Option<String> {
        self.rest = self.rest.trim_start();
        let rest = self.rest;
        if rest.is_empty() {
            return None;
        }
        let p = self.patterns;

        if let Some(m) = p.bool_pattern.find(rest) {
            self.advance(m.end());
            return Some(m.as_str().to_string());
        }
        if let Some(m) = p.null_pattern.find(rest) {
            self.advance(m.end());
            return Some("<nullptr>".to_string());
        }
        if let Some(caps) = p.ref_string_pattern.captures(rest) {
            // a `char *` prints its address then the string; keep the string
            self.advance(caps[1].len());
            return self.parse_c_string();
        }
        if let Some(m) = p.reference_pattern.find(rest) {
            self.advance(m.end());
            return Some(format!("*{}", m.as_str()));
        }
        if let Some(m) = p.cpp_ref_pattern.find(rest) {
            self.advance(m.end());
            return Some(m.as_str().to_string());
        }
        if let Some(caps) = p.char_pattern.captures(rest) {
            let code = caps[1].to_string();
            self.advance(code.len());
            let quoted = self.parse_c_string().unwrap_or_default();
            return Some(format!("{} {}", code, quoted));
        }
        for pattern in [&p.number_pattern, &p.variable_pattern, &p.error_pattern] {
            if let Some(m) = pattern.find(rest) {
                self.advance(m.end());
                return Some(m.as_str().to_string());
            }
        }

        self.rest = "";
        Some(rest.trim_end().to_string())
    }

    /// Namespace of `leaf` under the enclosing members. `[i]` attaches
    /// directly, names join with `.`, and leading `*`s move to the front.
    fn namespace(&self, leaf: &str) -> String {
        let mut namespace = self.root.to_string();
        for name in self.stack.iter().map(String::as_str).chain(std::iter::once(leaf)) {
            let bare = name.trim_start_matches('*');
            let stars = name.len() - bare.len();
            if bare.starts_with('[') || namespace.is_empty() {
                namespace.push_str(bare);
            } else {
                namespace.push('.');
                namespace.push_str(bare);
            }
            if stars > 0 {
                namespace.insert_str(0, &"*".repeat(stars));
            }
        }
        namespace
    }

    fn create_value(&mut self, name: &str, value: Expanded) -> ExpandedVariable {
        let (value, reference) = match value {
            Expanded::Compound(children) => {
                let reference = (self.register)(ExpansionTarget::Compound(children));
                ("Object".to_string(), reference)
            }
            Expanded::Scalar(text) if text.starts_with("*0x") => {
                let target = self.namespace(&format!("*{}", name));
                let reference = (self.register)(ExpansionTarget::Pointee(target));
                (format!("Object@{}", text), reference)
            }
            Expanded::Scalar(text) if text.starts_with("@0x") => {
                let target = format!("*&{}", self.namespace(name));
                let reference = (self.register)(ExpansionTarget::Pointee(target));
                (format!("Ref{}", text), reference)
            }
            Expanded::Scalar(text) if text.starts_with("<...>") => {
                let target = self.namespace(name);
                let reference = (self.register)(ExpansionTarget::Elided(target));
                ("...".to_string(), reference)
            }
            Expanded::Scalar(text) => (text, 0),
        };

        ExpandedVariable {
            name: name.to_string(),
            value,
            reference,
        }
    }
}
