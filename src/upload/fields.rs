//! Assembly of text fields into a structured JSON object.
//!
//! Field names may use bracket notation:
//!
//! - `name` sets a value; repeating it collects the values into an array
//! - `tags[]` appends to an array
//! - `user[address][city]` nests objects
//! - `rows[1]` indexes into an array, padding with nulls; indexes above
//!   [`MAX_ARRAY_INDEX`] are treated as object keys
//!
//! A name that is not well-formed bracket notation is used verbatim.

use serde_json::{Map, Value};

use crate::errors::{LimitCode, UploadError};

/// Inserts scalar field values into the session's fields object.
pub trait FieldAssembler: Send {
    fn append(
        &mut self,
        target: &mut Map<String, Value>,
        name: &str,
        value: String,
    ) -> Result<(), UploadError>;
}

/// Largest bracket index that addresses an array slot.
pub const MAX_ARRAY_INDEX: usize = 20;

/// One step of a parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
    Append,
}

/// Bracket-notation assembler.
#[derive(Debug, Clone, Default)]
pub struct BracketAssembler {
    /// Maximum number of keys in one field path.
    max_keys: Option<usize>,
}

impl BracketAssembler {
    pub fn new(max_keys: Option<usize>) -> Self {
        Self { max_keys }
    }
}

impl FieldAssembler for BracketAssembler {
    fn append(
        &mut self,
        target: &mut Map<String, Value>,
        name: &str,
        value: String,
    ) -> Result<(), UploadError> {
        let (head, rest) = parse_path(name);
        if let Some(max) = self.max_keys {
            if rest.len() + 1 > max {
                return Err(UploadError::limit_for(LimitCode::FieldKeys, name));
            }
        }

        match rest.split_first() {
            None => set_last(target.entry(head).or_insert(Value::Null), value),
            Some((next, tail)) => {
                let slot = target.entry(head).or_insert(Value::Null);
                insert_at(slot, next, tail, value);
            }
        }
        Ok(())
    }
}

/// Split `name` into its leading key and bracketed steps.
fn parse_path(name: &str) -> (String, Vec<Step>) {
    let Some(open) = name.find('[') else {
        return (name.to_string(), Vec::new());
    };
    if open == 0 {
        return (name.to_string(), Vec::new());
    }

    let head = &name[..open];
    let mut steps = Vec::new();
    let mut rest = &name[open..];
    while !rest.is_empty() {
        let Some(inner) = rest.strip_prefix('[') else {
            return (name.to_string(), Vec::new());
        };
        let Some(close) = inner.find(']') else {
            return (name.to_string(), Vec::new());
        };
        let segment = &inner[..close];
        if segment.contains('[') {
            return (name.to_string(), Vec::new());
        }
        steps.push(if segment.is_empty() {
            Step::Append
        } else if let Some(index) = segment
            .parse::<usize>()
            .ok()
            .filter(|index| *index <= MAX_ARRAY_INDEX)
        {
            Step::Index(index)
        } else {
            Step::Key(segment.to_string())
        });
        rest = &inner[close + 1..];
    }
    (head.to_string(), steps)
}

/// Descend into `slot` following `step` then `tail`, creating containers
/// as needed, and set the value at the end of the path.
fn insert_at(slot: &mut Value, step: &Step, tail: &[Step], value: String) {
    prepare_container(slot, step);

    let child = match (slot, step) {
        (Value::Array(items), Step::Append) => {
            items.push(Value::Null);
            items.last_mut()
        }
        (Value::Array(items), Step::Index(index)) => {
            if items.len() <= *index {
                items.resize(*index + 1, Value::Null);
            }
            items.get_mut(*index)
        }
        (Value::Object(map), Step::Key(key)) => Some(map.entry(key.clone()).or_insert(Value::Null)),
        (Value::Object(map), Step::Index(index)) => {
            Some(map.entry(index.to_string()).or_insert(Value::Null))
        }
        (Value::Object(map), Step::Append) => {
            let key = map.len().to_string();
            Some(map.entry(key).or_insert(Value::Null))
        }
        _ => None,
    };

    if let Some(child) = child {
        match tail.split_first() {
            None => set_last(child, value),
            Some((next, rest)) => insert_at(child, next, rest, value),
        }
    }
}

/// Make `slot` a container able to take `step`.
fn prepare_container(slot: &mut Value, step: &Step) {
    let wants_array = matches!(step, Step::Append | Step::Index(_));
    match slot {
        Value::Null => {
            *slot = if wants_array {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            };
        }
        Value::Array(items) if matches!(step, Step::Key(_)) => {
            let map = items
                .drain(..)
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (i.to_string(), v))
                .collect();
            *slot = Value::Object(map);
        }
        Value::Array(_) | Value::Object(_) => {}
        scalar => {
            let mut map = Map::new();
            map.insert(String::new(), scalar.take());
            *scalar = Value::Object(map);
        }
    }
}

/// Set a leaf value, collecting repeats into an array.
fn set_last(slot: &mut Value, value: String) {
    match slot {
        Value::Null => *slot = Value::String(value),
        Value::Array(items) => items.push(Value::String(value)),
        existing => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, Value::String(value)]);
        }
    }
}
