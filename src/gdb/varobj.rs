//! GDB variable objects
//!
//! A [`VariableObject`] mirrors one `var-create`d expression in the debugger.
//! Objects live in a [`VariableStore`] and are addressed by a numeric handle
//! that front ends hold on to, so updates always happen in place.

use crate::gdb::query::value_of_results;
use crate::gdb::types::{MiResult, MiValue, Variable};
use std::collections::HashMap;
use tracing::debug;

/// One named debugger value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableObject {
    /// GDB's name for the object, e.g. `var3.a`
    pub name: String,
    /// Expression relative to the parent
    pub exp: String,
    pub numchild: u32,
    pub var_type: String,
    pub value: String,
    pub thread_id: Option<String>,
    pub frozen: bool,
    pub dynamic: bool,
    pub display_hint: Option<String>,
    pub has_more: bool,
    /// Handle assigned by the store, 0 until stored
    pub id: u32,
    /// Handle of the parent scope or object
    pub parent: u32,
    pub full_exp: Option<String>,
    /// Child expression to child name
    pub children: HashMap<String, String>,
}

fn text(results: &[MiResult], key: &str) -> Option<String> {
    value_of_results(results, key).and_then(|v| v.as_str().map(str::to_string))
}

fn flag(results: &[MiResult], key: &str) -> bool {
    matches!(text(results, key).as_deref(), Some("1" | "true"))
}

impl VariableObject {
    /// Build from the fields of a `var-create` reply or a `child={...}` tuple
    pub fn from_results(parent: u32, results: &[MiResult]) -> Self {
        Self {
            name: text(results, "name").unwrap_or_default(),
            exp: text(results, "exp").unwrap_or_default(),
            numchild: text(results, "numchild")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            var_type: text(results, "type").unwrap_or_default(),
            value: text(results, "value").unwrap_or_default(),
            thread_id: text(results, "thread-id"),
            frozen: flag(results, "frozen"),
            dynamic: flag(results, "dynamic"),
            display_hint: text(results, "displayhint"),
            has_more: flag(results, "has_more"),
            id: 0,
            parent,
            full_exp: None,
            children: HashMap::new(),
        }
    }

    /// Apply one `var-update` change entry
    pub fn apply_changes(&mut self, change: &[MiResult]) {
        if let Some(value) = text(change, "value") {
            self.value = value;
        }
        if flag(change, "type_changed") {
            if let Some(new_type) = text(change, "new_type") {
                self.var_type = new_type;
            }
        }
        self.dynamic = flag(change, "dynamic");
        self.display_hint = text(change, "displayhint");
        self.has_more = flag(change, "has_more");
    }

    pub fn is_compound(&self) -> bool {
        self.numchild > 0
            || self.value == "{...}"
            || (self.dynamic && matches!(self.display_hint.as_deref(), Some("array" | "map")))
    }

    pub fn record_child(&mut self, child: &VariableObject) {
        self.children.insert(child.exp.clone(), child.name.clone());
    }

    /// Handle to expand this object with, 0 for scalars
    pub fn reference(&self) -> u32 {
        if self.is_compound() {
            self.id
        } else {
            0
        }
    }

    /// Render for a front end; scalar numbers get a multi-radix tooltip
    pub fn to_variable(&self) -> Variable {
        let value = if self.value.is_empty() {
            "<unknown>".to_string()
        } else {
            self.value.clone()
        };
        let tooltip = self.tooltip(&self.exp, &value);
        Variable {
            name: self.exp.clone(),
            evaluate_name: self.full_exp.clone().unwrap_or_else(|| self.exp.clone()),
            value,
            var_type: Some(tooltip),
            reference: self.reference(),
        }
    }

    fn tooltip(&self, name: &str, value: &str) -> String {
        if self.is_compound() {
            return self.var_type.clone();
        }
        match leading_integer(value) {
            Some(n) => format!("{} {};\n{}", self.var_type, name, to_string_dec_hex_oct_bin(n)),
            None => self.var_type.clone(),
        }
    }
}

/// Integer at the start of `value`: `0x...` hex or optionally negative decimal
pub fn leading_integer(value: &str) -> Option<i128> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        let end = hex.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(hex.len());
        return i128::from_str_radix(&hex[..end], 16).ok();
    }

    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    let n: i128 = digits[..end].parse().ok()?;
    Some(if negative { -n } else { n })
}

/// `dec/hex/oct/bin` lines for `val`.
///
/// Negative values are shown in the other radixes as their two's complement,
/// 32 bits wide when they fit in an `i32` and 64 bits otherwise.
pub fn to_string_dec_hex_oct_bin(val: i128) -> String {
    let unsigned: u128 = if val >= 0 {
        val as u128
    } else if val >= i128::from(i32::MIN) {
        u128::from(val as i32 as u32)
    } else {
        u128::from(val as i64 as u64)
    };

    let bits = format!("{:032b}", unsigned);
    let mut groups = Vec::new();
    let mut end = bits.len();
    while end > 8 {
        groups.push(&bits[end - 8..end]);
        end -= 8;
    }
    groups.push(&bits[..end]);
    groups.reverse();

    format!(
        "dec: {}\nhex: 0x{:08x}\noct: {:012o}\nbin: {}",
        val,
        unsigned,
        unsigned,
        groups.join(" ")
    )
}

/// Arena of variable objects with stable handles and a name index
#[derive(Debug)]
pub struct VariableStore {
    first_handle: u32,
    slots: Vec<Option<VariableObject>>,
    by_name: HashMap<String, u32>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl VariableStore {
    /// Handles are allocated upwards from `first_handle`
    pub fn new(first_handle: u32) -> Self {
        Self {
            first_handle: first_handle.max(1),
            slots: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    fn slot(&self, handle: u32) -> Option<usize> {
        handle.checked_sub(self.first_handle).map(|i| i as usize)
    }

    /// Store `object` unless one with the same name exists, and return the
    /// reference to hand out for it (0 for scalars). An existing object is
    /// never replaced.
    pub fn find_or_create(&mut self, mut object: VariableObject) -> u32 {
        if let Some(existing) = self.by_name.get(&object.name).and_then(|h| self.get(*h)) {
            return existing.reference();
        }

        let handle = self.first_handle + self.slots.len() as u32;
        object.id = handle;
        let reference = object.reference();
        self.by_name.insert(object.name.clone(), handle);
        self.slots.push(Some(object));
        reference
    }

    pub fn handle_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, handle: u32) -> Option<&VariableObject> {
        self.slots.get(self.slot(handle)?)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut VariableObject> {
        let index = self.slot(handle)?;
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn by_name(&self, name: &str) -> Option<&VariableObject> {
        self.get(self.handle_of(name)?)
    }

    /// Apply a `var-update` changelist in place.
    ///
    /// Objects that are merely out of scope (`in_scope="false"`) keep their
    /// handle and come back when the scope does. Returns the names GDB
    /// reported as `invalid`; those are dropped from the store along with
    /// their children and should be `var-delete`d.
    pub fn apply_update(&mut self, changelist: &MiValue) -> Vec<String> {
        let mut invalid = Vec::new();
        for change in changelist.as_list().unwrap_or_default() {
            let Some(change) = change.as_results() else {
                continue;
            };
            let Some(name) = text(change, "name") else {
                continue;
            };

            if text(change, "in_scope").as_deref() == Some("invalid") {
                self.remove(&name);
                invalid.push(name);
                continue;
            }
            match self.handle_of(&name).and_then(|h| self.get_mut(h)) {
                Some(object) => object.apply_changes(change),
                None => debug!("Change for unknown variable object {}", name),
            }
        }
        invalid
    }

    /// Store the children `var-list-children` returned for `parent` and
    /// render them in listing order.
    ///
    /// Each child gets its evaluate path from the parent's: `parent[i]` for
    /// array elements, `parent.member` for members, and the parent's own path
    /// for anonymous unions and structs, which are numbered `#1`, `#2`, ... when
    /// they repeat. Named members are recorded in the parent's child map.
    pub fn adopt_children(&mut self, parent: u32, children: Vec<VariableObject>) -> Vec<Variable> {
        let parent_path = self
            .get(parent)
            .map(|p| p.full_exp.clone().unwrap_or_else(|| p.exp.clone()))
            .unwrap_or_default();
        let mut anonymous: HashMap<String, u32> = HashMap::new();
        let mut rendered = Vec::with_capacity(children.len());

        for mut child in children {
            if !child.exp.is_empty() && child.exp.bytes().all(|b| b.is_ascii_digit()) {
                child.full_exp = Some(format!("{}[{}]", parent_path, child.exp));
            } else if child.exp.starts_with("<anonymous") {
                if let Some(seen) = anonymous.get(&child.exp).copied() {
                    anonymous.insert(child.exp.clone(), seen + 1);
                    child.exp = format!("{}#{}", child.exp, seen);
                }
                anonymous.insert(child.exp.clone(), 1);
                child.full_exp = Some(parent_path.clone());
            } else {
                if let Some(parent) = self.get_mut(parent) {
                    parent.record_child(&child);
                }
                child.full_exp = Some(format!("{}.{}", parent_path, child.exp));
            }

            self.find_or_create(child.clone());
            child.id = self.handle_of(&child.name).unwrap_or(0);
            rendered.push(child.to_variable());
        }
        rendered
    }

    /// Drop `name` and every `name.`-prefixed descendant; returns how many
    /// objects went away. Handles are not reused.
    pub fn remove(&mut self, name: &str) -> usize {
        let prefix = format!("{}.", name);
        let doomed: Vec<(String, u32)> = self
            .by_name
            .iter()
            .filter(|(n, _)| n.as_str() == name || n.starts_with(&prefix))
            .map(|(n, h)| (n.clone(), *h))
            .collect();

        for (n, handle) in &doomed {
            self.by_name.remove(n);
            if let Some(index) = self.slot(*handle) {
                if let Some(slot) = self.slots.get_mut(index) {
                    *slot = None;
                }
            }
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_name.clear();
    }
}
