//! Envelope passed along the edges of a workflow graph. Every task reads zero or more
//! [`Message`]s from its upstream channels and produces zero or more on its outputs.

use std::collections::HashMap;

/// Header carrying the name of the task that produced a message. Present on every message the
/// scheduler delivers so a task can tell which upstream instance a value came from when it has
/// more than one incoming edge from the same task (a proxied connection).
pub const HEADER_TASK_NAME: &str = "task_name";
/// Header carrying the map index a message belongs to. Set by a Map task when it fans a list out
/// into one message per element, read back by the matching Reduce task to group replies.
pub const HEADER_MAP_INDEX: &str = "map_index";
/// Sentinel input name used for tasks that declare no real inputs but still need one message to
/// bootstrap their `process` call.
pub const DUMMY_INPUT_NAME: &str = "None";

/// A single value flowing along an edge, plus the headers accumulated on its way there.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Payload,
    pub headers: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            headers: HashMap::new(),
        }
    }

    /// Read the [`HEADER_MAP_INDEX`] header, if present and parseable.
    pub fn map_index(&self) -> Option<i64> {
        self.headers.get(HEADER_MAP_INDEX)?.parse().ok()
    }

    pub fn with_map_index(mut self, index: i64) -> Self {
        self.headers
            .insert(HEADER_MAP_INDEX.to_owned(), index.to_string());
        self
    }

    pub fn with_task_name(mut self, name: &str) -> Self {
        self.headers
            .insert(HEADER_TASK_NAME.to_owned(), name.to_owned());
        self
    }
}

/// The value a [`Message`] carries. Mirrors the shapes a WPS input or output can take.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A scalar literal value (numbers, strings, booleans are all carried as their textual form).
    Literal(String),
    /// Complex data embedded directly in the message.
    ComplexInline { data: String, mime_type: String },
    /// Complex data left on a remote server, referenced by URL.
    ComplexRef { url: String, mime_type: String },
    /// A bounding box value.
    BoundingBox { crs: String, coords: Vec<f64> },
    /// The raw output object produced by a remote execution, not yet adapted to a specific
    /// downstream input. Held this way until the data adapter resolves how to shape it, so a
    /// single output can feed several incompatible-looking inputs correctly.
    Output(WpsOutputValue),
}

impl Payload {
    /// Dummy payload used to bootstrap tasks that have no real upstream input.
    pub fn dummy() -> Self {
        Self::Literal(String::new())
    }
}

/// Raw output value as reported by a remote process, before adaptation.
#[derive(Debug, Clone)]
pub struct WpsOutputValue {
    pub identifier: String,
    pub title: String,
    pub data_type: Kind,
    pub mime_type: Option<String>,
    pub reference: Option<String>,
    pub data: Vec<String>,
}

/// The three datatype families WPS distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Literal,
    Complex,
    BoundingBox,
}

/// Description of one declared input or output of a remote process, used when deciding how to
/// adapt a value and when reporting a [`crate::error::Error::DatatypeIncompatible`].
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub identifier: String,
    pub kind: Kind,
    pub mime_type: Option<String>,
}
