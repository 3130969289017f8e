//! Data Adapter: reconciles an upstream [`WpsOutputValue`] with a downstream
//! [`ProcessInput`] descriptor, producing the one or more [`Payload`]s the downstream task
//! should actually submit.

use common::error::EmError;

use crate::{
    error::{Error, Result},
    message::{Descriptor, Kind, Payload, WpsOutputValue},
    wps::{DataType, ProcessInput},
};

/// Adapts `output` into zero-or-more payloads suitable for `input`. `expects_reference` mirrors
/// the downstream's `as_reference` flag on the linked input that produced this edge.
pub async fn adapt(
    http: &reqwest::Client,
    task_name: &str,
    output: &WpsOutputValue,
    input: &ProcessInput,
    expects_reference: bool,
) -> Result<Vec<Payload>> {
    let mut effective_kinds = vec![output.data_type];
    let value = if let Some(reference) = &output.reference {
        if expects_reference {
            effective_kinds.push(Kind::Literal);
            reference.clone()
        } else {
            match http.get(reference).send().await {
                Ok(response) => response.text().await.unwrap_or_default(),
                Err(_) => String::new(),
            }
        }
    } else if let Some(first) = output.data.first() {
        first.clone()
    } else {
        return Err(incompatible(task_name, input, output));
    };

    if value.is_empty() && output.reference.is_some() && !expects_reference {
        return Err(incompatible(task_name, input, output));
    }

    if is_compatible(input, &effective_kinds, output.mime_type.as_deref()) {
        return Ok(vec![single_payload(input, output, value, expects_reference)]);
    }

    if input.max_occurs > 1
        && output.data_type == Kind::Complex
        && output.mime_type.as_deref() == Some("application/json")
    {
        if let Ok(serde_json::Value::Array(elements)) = serde_json::from_str::<serde_json::Value>(&value) {
            let mime_type = complex_mime_type(input);
            return Ok(elements
                .into_iter()
                .map(|element| {
                    let text = match element {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    match input.data_type.kind() {
                        Kind::Literal => Payload::Literal(text),
                        Kind::BoundingBox => Payload::Literal(text),
                        Kind::Complex => Payload::ComplexInline { data: text, mime_type: mime_type.clone() },
                    }
                })
                .collect());
        }
    }

    Err(incompatible(task_name, input, output))
}

fn is_compatible(input: &ProcessInput, output_kinds: &[Kind], output_mime_type: Option<&str>) -> bool {
    if !output_kinds.contains(&input.data_type.kind()) {
        return false;
    }
    if input.data_type.kind() != Kind::Complex {
        return true;
    }
    let DataType::Complex { supported_mime_types, .. } = &input.data_type else {
        return false;
    };
    output_mime_type.is_some_and(|mime_type| supported_mime_types.iter().any(|m| m == mime_type))
}

fn complex_mime_type(input: &ProcessInput) -> String {
    match &input.data_type {
        DataType::Complex { supported_mime_types, default_mime_type, .. } => supported_mime_types
            .first()
            .cloned()
            .unwrap_or_else(|| default_mime_type.clone()),
        _ => "application/octet-stream".to_owned(),
    }
}

fn single_payload(
    input: &ProcessInput,
    output: &WpsOutputValue,
    value: String,
    expects_reference: bool,
) -> Payload {
    match input.data_type.kind() {
        Kind::Literal => Payload::Literal(value),
        Kind::BoundingBox => Payload::Literal(value),
        Kind::Complex if expects_reference && output.reference.is_some() => Payload::ComplexRef {
            url: value,
            mime_type: complex_mime_type(input),
        },
        Kind::Complex => Payload::ComplexInline { data: value, mime_type: complex_mime_type(input) },
    }
}

fn incompatible(task_name: &str, input: &ProcessInput, output: &WpsOutputValue) -> Error {
    Error::DatatypeIncompatible {
        task: task_name.to_owned(),
        input: Descriptor {
            identifier: input.identifier.clone(),
            kind: input.data_type.kind(),
            mime_type: match &input.data_type {
                DataType::Complex { default_mime_type, .. } => Some(default_mime_type.clone()),
                _ => None,
            },
        },
        output: Descriptor {
            identifier: output.identifier.clone(),
            kind: output.data_type,
            mime_type: output.mime_type.clone(),
        },
    }
}

/// Converts a generic transport failure while fetching a reference into the crate error type,
/// used by callers that need to surface it rather than silently yielding empty data.
pub fn reference_fetch_error(url: &str, source: reqwest::Error) -> Error {
    Error::RemoteUnavailable { url: url.to_owned(), source: EmError::from(source) }
}
