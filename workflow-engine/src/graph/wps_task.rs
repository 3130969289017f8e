//! WPS Task node (C4): wraps one remote process behind the flattened node model. [`WpsState`]
//! executes once, accumulating every linked input before submitting; [`ParallelWpsState`] is the
//! variant a parallel group's member tasks use, executing once per inbound (mapped) message.

use std::{
    collections::HashMap,
    sync::Arc,
};

use tokio::sync::Mutex as AsyncMutex;

use crate::{
    adapter,
    error::{Error, Result},
    message::{Message, Payload, WpsOutputValue},
    monitor::{OutputRecord, TaskResultRecord, WorkflowMonitor},
    progress::{RangeGroupProgress, RangeProgress},
    wps::{poll_until_terminal, DataType, ExecutionStatus, PollTiming, ProcessDescription, WpsClient, WpsInputValue},
};

fn status_string(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Accepted => "ProcessAccepted",
        ExecutionStatus::Started => "ProcessStarted",
        ExecutionStatus::Paused => "ProcessPaused",
        ExecutionStatus::Succeeded => "ProcessSucceeded",
        ExecutionStatus::Failed => "ProcessFailed",
    }
    .to_owned()
}

fn payload_to_wps_input(payload: &Payload) -> WpsInputValue {
    match payload {
        Payload::Literal(text) => WpsInputValue::Literal(text.clone()),
        Payload::ComplexInline { data, mime_type } => {
            WpsInputValue::Complex { data: data.clone(), mime_type: mime_type.clone(), is_reference: false }
        }
        Payload::ComplexRef { url, mime_type } => {
            WpsInputValue::Complex { data: url.clone(), mime_type: mime_type.clone(), is_reference: true }
        }
        Payload::BoundingBox { crs, coords } => WpsInputValue::BoundingBox { crs: crs.clone(), coords: coords.clone() },
        // The adapter always resolves a raw `Output` into a concrete payload before it reaches a
        // task's input accumulator, so this arm is unreachable in practice.
        Payload::Output(_) => WpsInputValue::Literal(String::new()),
    }
}

fn output_record(value: &WpsOutputValue) -> OutputRecord {
    OutputRecord {
        identifier: value.identifier.clone(),
        mime_type: value.mime_type.clone(),
        reference: value.reference.clone(),
        data: value.data.clone(),
    }
}

fn backfill_mime_type(mut value: WpsOutputValue, description: &ProcessDescription) -> WpsOutputValue {
    if value.mime_type.is_none() {
        if let Some(output) = description.output(&value.identifier) {
            if let DataType::Complex { default_mime_type, .. } = &output.data_type {
                value.mime_type = Some(default_mime_type.clone());
            }
        }
    }
    value
}

/// One linked input this task accepts: its descriptor name and whether the edge asked for a
/// reference rather than an inline value.
pub struct LinkedInput {
    pub name: String,
    pub as_reference: bool,
}

/// Non-parallel WPS Task: accumulates every linked input across possibly many inbound messages,
/// then submits exactly one execute request in `postprocess`.
pub struct WpsState {
    pub name: String,
    pub url: String,
    pub identifier: String,
    pub description: Arc<ProcessDescription>,
    pub static_inputs: Vec<(String, String)>,
    pub linked_input_names: std::collections::HashSet<String>,
    pub linked_as_reference: HashMap<String, bool>,
    pub requested_outputs: Vec<(String, bool)>,
    pub progress_range: RangeProgress,
    pub client: Arc<dyn WpsClient>,
    pub timing: PollTiming,
    pub http: reqwest::Client,
    pub monitor: Arc<dyn WorkflowMonitor>,
    pub headers: HashMap<String, String>,
    collected: AsyncMutex<HashMap<String, Vec<Payload>>>,
    data_headers: AsyncMutex<HashMap<String, String>>,
}

impl WpsState {
    pub fn new(
        name: String,
        url: String,
        identifier: String,
        description: Arc<ProcessDescription>,
        static_inputs: Vec<(String, String)>,
        linked_inputs: Vec<LinkedInput>,
        requested_outputs: Vec<(String, bool)>,
        progress_range: RangeProgress,
        client: Arc<dyn WpsClient>,
        timing: PollTiming,
        http: reqwest::Client,
        monitor: Arc<dyn WorkflowMonitor>,
        headers: HashMap<String, String>,
    ) -> Self {
        let linked_input_names = linked_inputs.iter().map(|linked| linked.name.clone()).collect();
        let linked_as_reference = linked_inputs.into_iter().map(|linked| (linked.name, linked.as_reference)).collect();
        Self {
            name,
            url,
            identifier,
            description,
            static_inputs,
            linked_input_names,
            linked_as_reference,
            requested_outputs,
            progress_range,
            client,
            timing,
            http,
            monitor,
            headers,
            collected: AsyncMutex::new(HashMap::new()),
            data_headers: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn process(&self, input_name: &str, message: Message) -> Result<Vec<(String, Message)>> {
        self.data_headers.lock().await.extend(message.headers.clone());

        if input_name == crate::message::DUMMY_INPUT_NAME {
            return Ok(Vec::new());
        }

        let input = self.description.input(input_name).ok_or_else(|| {
            Error::WorkflowInvalid(format!("task `{}` has no input named `{input_name}`", self.name))
        })?;
        let as_reference = self.linked_as_reference.get(input_name).copied().unwrap_or(false);

        let payloads = match message.payload {
            Payload::Output(output) => adapter::adapt(&self.http, &self.name, &output, input, as_reference).await?,
            other => vec![other],
        };

        self.collected.lock().await.entry(input_name.to_owned()).or_default().extend(payloads);
        Ok(Vec::new())
    }

    pub async fn postprocess(&self) -> Result<Vec<(String, Message)>> {
        let collected = self.collected.lock().await;
        for name in &self.linked_input_names {
            if name == crate::message::DUMMY_INPUT_NAME {
                continue;
            }
            if collected.get(name).map_or(true, Vec::is_empty) {
                return Err(Error::WorkflowInvalid(format!(
                    "task `{}` never received a value for linked input `{name}`",
                    self.name
                )));
            }
        }

        let mut inputs: Vec<(String, WpsInputValue)> = self
            .static_inputs
            .iter()
            .map(|(name, value)| (name.clone(), WpsInputValue::Literal(value.clone())))
            .collect();
        for (name, payloads) in collected.iter() {
            for payload in payloads {
                inputs.push((name.clone(), payload_to_wps_input(payload)));
            }
        }
        drop(collected);

        let mut headers = self.data_headers.lock().await.clone();
        headers.extend(self.headers.clone());

        let mut handle = self
            .client
            .execute(&self.url, &self.identifier, &inputs, &self.requested_outputs, &headers)
            .await?;
        self.monitor
            .update_status(&self.name, &format!("status_location={}", handle.status_location), None);

        let mut last_message = handle.status_message.clone();
        let mut last_progress: Option<u8> = None;
        let range = self.progress_range;
        let monitor = Arc::clone(&self.monitor);
        let name = self.name.clone();
        poll_until_terminal(&*self.client, &mut handle, &self.timing, |snapshot| {
            let scaled = range.scale(snapshot.percent_completed);
            if snapshot.status_message != last_message || Some(scaled) != last_progress {
                monitor.update_status(&name, snapshot.status_message.as_deref().unwrap_or(""), Some(scaled));
                last_message = snapshot.status_message.clone();
                last_progress = Some(scaled);
            }
        })
        .await?;

        if handle.status == ExecutionStatus::Failed {
            let text = handle.errors.iter().map(|error| error.text.clone()).collect::<Vec<_>>().join("; ");
            self.monitor.raise_exception(&self.name, &text);
            return Err(Error::RemoteFailed(text));
        }

        let mut outbound = Vec::new();
        let mut records = Vec::new();
        for (output_name, _) in &self.requested_outputs {
            let Some(found) = handle.process_outputs.iter().find(|output| &output.identifier == output_name) else {
                continue;
            };
            let value = backfill_mime_type(found.clone(), &self.description);
            records.push(output_record(&value));
            outbound.push((output_name.clone(), Message::new(Payload::Output(value))));
        }

        self.monitor.save_task_result(
            &self.name,
            TaskResultRecord {
                status: status_string(handle.status),
                status_location: handle.status_location.clone(),
                outputs: records,
                data_id: None,
                process_id: None,
            },
        );

        outbound.push(("status".to_owned(), Message::new(Payload::Literal(status_string(handle.status)))));
        outbound.push(("status_location".to_owned(), Message::new(Payload::Literal(handle.status_location))));
        Ok(outbound)
    }
}

/// Parallel WPS Task: the member task of a parallel group. Runs the full execute-and-poll cycle
/// inside `process`, once per mapped message, rather than accumulating into a single
/// `postprocess` call.
pub struct ParallelWpsState {
    pub name: String,
    pub max_processes: u32,
    pub url: String,
    pub identifier: String,
    pub description: Arc<ProcessDescription>,
    pub static_inputs: Vec<(String, String)>,
    pub linked_input: Option<LinkedInput>,
    pub requested_outputs: Vec<(String, bool)>,
    pub group_progress: RangeGroupProgress,
    pub client: Arc<dyn WpsClient>,
    pub timing: PollTiming,
    pub http: reqwest::Client,
    pub monitor: Arc<dyn WorkflowMonitor>,
    pub headers: HashMap<String, String>,
}

impl ParallelWpsState {
    pub async fn process(&self, rank: u32, message: Message) -> Result<Vec<(String, Message)>> {
        let map_index = message.map_index();
        let mut inputs: Vec<(String, WpsInputValue)> = self
            .static_inputs
            .iter()
            .map(|(name, value)| (name.clone(), WpsInputValue::Literal(value.clone())))
            .collect();

        if let Some(linked) = &self.linked_input {
            let input = self.description.input(&linked.name).ok_or_else(|| {
                Error::WorkflowInvalid(format!("task `{}` has no input named `{}`", self.name, linked.name))
            })?;
            let payloads = match message.payload {
                Payload::Output(output) => adapter::adapt(&self.http, &self.name, &output, input, linked.as_reference).await?,
                other => vec![other],
            };
            for payload in payloads {
                inputs.push((linked.name.clone(), payload_to_wps_input(&payload)));
            }
        }

        let decorated = format!("{}-proc{rank}-data{}", self.name, map_index.unwrap_or(-1));

        let mut handle = self
            .client
            .execute(&self.url, &self.identifier, &inputs, &self.requested_outputs, &self.headers)
            .await?;
        self.monitor
            .update_status(&decorated, &format!("status_location={}", handle.status_location), None);

        let slot = map_index.unwrap_or(0).max(0) as usize;
        let group_progress = self.group_progress.clone();
        let monitor = Arc::clone(&self.monitor);
        let decorated_for_progress = decorated.clone();
        poll_until_terminal(&*self.client, &mut handle, &self.timing, |snapshot| {
            group_progress.record(slot, snapshot.percent_completed);
            monitor.update_status(
                &decorated_for_progress,
                snapshot.status_message.as_deref().unwrap_or(""),
                Some(group_progress.mean()),
            );
        })
        .await?;

        if handle.status == ExecutionStatus::Failed {
            let text = handle.errors.iter().map(|error| error.text.clone()).collect::<Vec<_>>().join("; ");
            self.monitor.raise_exception(&decorated, &text);
            return Err(Error::RemoteFailed(text));
        }

        let mut outbound = Vec::new();
        let mut records = Vec::new();
        for (output_name, _) in &self.requested_outputs {
            let Some(found) = handle.process_outputs.iter().find(|output| &output.identifier == output_name) else {
                continue;
            };
            let value = backfill_mime_type(found.clone(), &self.description);
            records.push(output_record(&value));
            let mut out_message = Message::new(Payload::Output(value));
            if let Some(index) = map_index {
                out_message = out_message.with_map_index(index);
            }
            outbound.push((output_name.clone(), out_message));
        }

        self.monitor.save_task_result(
            &self.name,
            TaskResultRecord {
                status: status_string(handle.status),
                status_location: handle.status_location.clone(),
                outputs: records,
                data_id: map_index,
                process_id: Some(rank),
            },
        );

        let mut status_message = Message::new(Payload::Literal(status_string(handle.status)));
        let mut location_message = Message::new(Payload::Literal(handle.status_location));
        if let Some(index) = map_index {
            status_message = status_message.with_map_index(index);
            location_message = location_message.with_map_index(index);
        }
        outbound.push(("status".to_owned(), status_message));
        outbound.push(("status_location".to_owned(), location_message));
        Ok(outbound)
    }
}
