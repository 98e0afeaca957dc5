//! Path queries over parsed MI values
//!
//! A path is a sequence of segments:
//!
//! * `name` or `.name` selects the entries called `name`. When several
//!   siblings share the name they are all kept, as a list.
//! * `[i]` picks the i-th element. `[0]` on something that is not a
//!   collection is the thing itself.
//! * `@` wraps the current value in a one-element list, so a named pair can
//!   be looked into with `@name.field`.

use crate::gdb::types::{MiNode, MiResult, MiValue, OutOfBandRecord};

/// Borrowed position in a value tree while a path is being resolved
#[derive(Debug, Clone)]
enum Cursor<'a> {
    Value(&'a MiValue),
    Results(&'a [MiResult]),
    Pair(&'a MiResult),
    Many(Vec<Cursor<'a>>),
    Wrapped(Box<Cursor<'a>>),
}

#[derive(Debug, PartialEq)]
enum Segment<'p> {
    Name(&'p str),
    Wrap,
    Index(usize),
}

/// Split the next segment off `path`; `None` for malformed input
fn next_segment(path: &str) -> Option<(Segment<'_>, &str)> {
    if let Some(rest) = path.strip_prefix('@') {
        return Some((Segment::Wrap, rest));
    }

    if let Some(inner) = path.strip_prefix('[') {
        let close = inner.find(']')?;
        let index = inner[..close].parse().ok()?;
        let rest = &inner[close + 1..];
        let rest = rest.strip_prefix('.').unwrap_or(rest);
        return Some((Segment::Index(index), rest));
    }

    let body = path.strip_prefix('.').unwrap_or(path);
    let first = body.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_' || first == '-') {
        return None;
    }
    let end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(body.len());
    Some((Segment::Name(&body[..end]), &body[end..]))
}

impl<'a> Cursor<'a> {
    fn named_entries(&self) -> Option<&'a [MiResult]> {
        match self {
            Cursor::Results(rs) => Some(*rs),
            Cursor::Value(v) => (*v).as_results(),
            _ => None,
        }
    }

    fn select(&self, name: &str) -> Option<Cursor<'a>> {
        let mut found: Vec<Cursor<'a>> = if let Some(entries) = self.named_entries() {
            entries
                .iter()
                .filter(|r| r.variable == name)
                .map(|r| Cursor::Value(&r.value))
                .collect()
        } else {
            let candidates: Vec<&Cursor<'a>> = match self {
                Cursor::Wrapped(inner) => vec![inner.as_ref()],
                Cursor::Many(items) => items.iter().collect(),
                _ => return None,
            };
            candidates
                .into_iter()
                .filter_map(|c| match c {
                    Cursor::Pair(r) if r.variable == name => Some(Cursor::Value(&r.value)),
                    _ => None,
                })
                .collect()
        };

        match found.len() {
            0 => None,
            1 => found.pop(),
            _ => Some(Cursor::Many(found)),
        }
    }

    fn index(&self, i: usize) -> Option<Cursor<'a>> {
        let picked = match self {
            Cursor::Results(rs) => rs.get(i).map(Cursor::Pair),
            Cursor::Value(v) => match *v {
                MiValue::Tuple(rs) | MiValue::ResultList(rs) => rs.get(i).map(Cursor::Pair),
                MiValue::List(vs) => vs.get(i).map(Cursor::Value),
                MiValue::Const(_) | MiValue::Empty => None,
            },
            Cursor::Many(items) => items.get(i).cloned(),
            Cursor::Wrapped(inner) => (i == 0).then(|| inner.as_ref().clone()),
            Cursor::Pair(_) => None,
        };
        picked.or_else(|| (i == 0).then(|| self.clone()))
    }

    fn into_value(self) -> MiValue {
        match self {
            Cursor::Value(v) => v.clone(),
            Cursor::Results(rs) => MiValue::ResultList(rs.to_vec()),
            Cursor::Pair(r) => MiValue::Tuple(vec![r.clone()]),
            Cursor::Many(items) => MiValue::List(items.into_iter().map(Cursor::into_value).collect()),
            Cursor::Wrapped(inner) => MiValue::List(vec![inner.into_value()]),
        }
    }
}

fn resolve(mut current: Cursor<'_>, path: &str) -> Option<MiValue> {
    let mut path = path.trim();
    while !path.is_empty() {
        let (segment, rest) = next_segment(path)?;
        current = match segment {
            Segment::Name(name) => current.select(name)?,
            Segment::Wrap => Cursor::Wrapped(Box::new(current)),
            Segment::Index(i) => current.index(i)?,
        };
        path = rest.trim();
    }
    Some(current.into_value())
}

/// Resolve `path` against a list of named entries
pub fn value_of_results(results: &[MiResult], path: &str) -> Option<MiValue> {
    resolve(Cursor::Results(results), path)
}

impl MiValue {
    /// Resolve `path` relative to this value
    pub fn value_of(&self, path: &str) -> Option<MiValue> {
        resolve(Cursor::Value(self), path)
    }
}

impl MiResult {
    /// Resolve `path` relative to this pair; use `@name...` to look inside it
    pub fn value_of(&self, path: &str) -> Option<MiValue> {
        resolve(Cursor::Pair(self), path)
    }
}

impl MiNode {
    /// Query the result record's results
    pub fn result(&self, path: &str) -> Option<MiValue> {
        let record = self.result_record.as_ref()?;
        value_of_results(&record.results, path)
    }

    /// Query the first out-of-band record, when it is an async record
    pub fn record(&self, path: &str) -> Option<MiValue> {
        match self.out_of_band.first()? {
            OutOfBandRecord::Async { output, .. } => value_of_results(output, path),
            OutOfBandRecord::Stream { .. } => None,
        }
    }
}
