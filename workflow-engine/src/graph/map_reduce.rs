//! Map and Reduce nodes (C5): the fan-out/fan-in pair bracketing a parallel group. Map turns one
//! list-shaped value into one message per element, stamped with a descending `map_index`; Reduce
//! collects them back into a single JSON array once every index has reported.

use std::sync::Mutex;

use serde_json::Value;

use crate::{
    error::{Error, Result},
    message::{Message, Payload},
};

/// Splits a list (either a fixed literal configured on the workflow, or the JSON array carried by
/// an upstream message) into one message per element.
pub struct MapState {
    name: String,
    literal_list: Option<Vec<String>>,
    pending: Mutex<Option<Vec<String>>>,
}

impl MapState {
    pub fn new(name: String, literal_list: Option<Vec<String>>) -> Self {
        Self { name, literal_list, pending: Mutex::new(None) }
    }

    /// A literal-configured map has no upstream input and is bootstrapped like any other source.
    pub fn is_literal_source(&self) -> bool {
        self.literal_list.is_some()
    }

    pub fn process(&self, message: Message) -> Result<Vec<(String, Message)>> {
        if self.literal_list.is_some() {
            return Ok(Vec::new());
        }
        let elements = extract_array(&message.payload).ok_or_else(|| {
            Error::WorkflowInvalid(format!("task `{}` could not read a JSON array to map over", self.name))
        })?;
        *self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(elements);
        Ok(Vec::new())
    }

    /// Emits in descending index order: the highest index first, down to zero.
    pub fn postprocess(&self) -> Result<Vec<(String, Message)>> {
        let elements = if let Some(list) = &self.literal_list {
            list.clone()
        } else {
            self.pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
                .ok_or_else(|| Error::WorkflowInvalid(format!("task `{}` never received a list to map over", self.name)))?
        };

        Ok(elements
            .into_iter()
            .enumerate()
            .rev()
            .map(|(index, value)| {
                let message = Message::new(Payload::Literal(value)).with_map_index(index as i64);
                ("map_out".to_owned(), message)
            })
            .collect())
    }
}

fn extract_array(payload: &Payload) -> Option<Vec<String>> {
    let text = match payload {
        Payload::Literal(text) | Payload::ComplexInline { data: text, .. } => text.clone(),
        Payload::Output(output) => output.data.first().cloned().unwrap_or_default(),
        Payload::ComplexRef { .. } | Payload::BoundingBox { .. } => return None,
    };
    match serde_json::from_str::<Value>(&text).ok()? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(text) => text,
                    other => other.to_string(),
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Collects one value per `map_index` and, once every slot is filled, emits a single JSON array.
pub struct ReduceState {
    name: String,
    slots: Mutex<Vec<Option<Payload>>>,
}

impl ReduceState {
    pub fn new(name: String) -> Self {
        Self { name, slots: Mutex::new(Vec::new()) }
    }

    pub fn process(&self, message: Message) -> Result<Vec<(String, Message)>> {
        let index = message
            .map_index()
            .ok_or_else(|| Error::WorkflowInvalid(format!("task `{}` received a message with no map index to reduce by", self.name)))?;
        let index = usize::try_from(index)
            .map_err(|_| Error::WorkflowInvalid(format!("task `{}` received a negative map index", self.name)))?;

        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        slots[index] = Some(message.payload);
        Ok(Vec::new())
    }

    pub fn postprocess(&self) -> Result<Vec<(String, Message)>> {
        let slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut values = Vec::with_capacity(slots.len());
        for (index, slot) in slots.iter().enumerate() {
            let Some(payload) = slot else {
                return Err(Error::WorkflowInvalid(format!("task `{}` never received a value for map index {index}", self.name)));
            };
            values.push(payload_to_json(payload));
        }
        let array = Value::Array(values).to_string();
        let message = Message::new(Payload::ComplexInline { data: array, mime_type: "application/json".to_owned() });
        Ok(vec![("reduce_out".to_owned(), message)])
    }
}

fn payload_to_json(payload: &Payload) -> Value {
    match payload {
        Payload::Literal(text) | Payload::ComplexInline { data: text, .. } | Payload::ComplexRef { url: text, .. } => {
            Value::String(text.clone())
        }
        Payload::BoundingBox { coords, .. } => Value::Array(coords.iter().map(|coord| serde_json::json!(coord)).collect()),
        Payload::Output(output) => output
            .reference
            .clone()
            .or_else(|| output.data.first().cloned())
            .map_or(Value::Null, Value::String),
    }
}
