//! Flattened task-node model. Every node in a compiled workflow graph is one [`TaskNode`], whose
//! variant-specific behavior lives in [`NodeKind`] rather than in a subclass.

mod builder;
mod map_reduce;
mod proxy;
mod wps_task;

pub use builder::GraphBuilder;
pub use map_reduce::{MapState, ReduceState};
pub use proxy::ProxyState;
pub use wps_task::{ParallelWpsState, WpsState};

use crate::{
    error::Result,
    message::{Message, HEADER_TASK_NAME},
};

/// A resolved edge between two nodes, produced by the [`GraphBuilder`] and consumed by the
/// scheduler. `from_id`/`to_id` are [`TaskNode::id`] values, not the user-visible task name: a
/// parallel group's Map and Reduce nodes share one name but each gets its own id, so the
/// scheduler can tell their channels apart.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from_id: String,
    pub from_output: String,
    pub to_id: String,
    pub to_input: String,
}

/// Variant-specific node behavior, dispatched by enum instead of a class hierarchy per node kind.
pub enum NodeKind {
    Wps(WpsState),
    ParallelWps(ParallelWpsState),
    Map(MapState),
    Reduce(ReduceState),
    Proxy(ProxyState),
}

/// One node of the compiled graph. Every inbound message updates `data_headers`, which is then
/// stamped (with the task name) onto every outbound message so propagating metadata (like the
/// originating task and the map index) survives a chain of adapters and proxies.
///
/// `id` is the scheduler's channel key, unique per node. `name` is the user-visible task/group
/// name used for monitor reporting and message stamping; a group's Map and Reduce both carry the
/// group's `name` but get distinct `id`s (see [`GraphBuilder`]).
pub struct TaskNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
}

impl TaskNode {
    pub const fn new(id: String, name: String, kind: NodeKind) -> Self {
        Self { id, name, kind }
    }

    /// Number of worker replicas this node should run as. Only parallel WPS tasks replicate;
    /// every other node kind is single-instance.
    pub fn replica_count(&self) -> u32 {
        match &self.kind {
            NodeKind::ParallelWps(state) => state.max_processes,
            NodeKind::Wps(_) | NodeKind::Map(_) | NodeKind::Reduce(_) | NodeKind::Proxy(_) => 1,
        }
    }

    /// True for nodes that receive no linked input and must be bootstrapped with a dummy
    /// triggering message to start.
    pub fn is_source(&self) -> bool {
        match &self.kind {
            NodeKind::Wps(state) => state.linked_input_names.is_empty(),
            NodeKind::Map(state) => state.is_literal_source(),
            NodeKind::ParallelWps(_) | NodeKind::Reduce(_) | NodeKind::Proxy(_) => false,
        }
    }

    /// Handles one inbound message on the named input. `rank` identifies which replica is
    /// running, used only by parallel WPS tasks for monitor decoration.
    pub async fn process(&self, input_name: &str, rank: u32, message: Message) -> Result<Vec<(String, Message)>> {
        match &self.kind {
            NodeKind::Wps(state) => state.process(input_name, message).await,
            NodeKind::ParallelWps(state) => state.process(rank, message).await,
            NodeKind::Map(state) => state.process(message),
            NodeKind::Reduce(state) => state.process(message),
            NodeKind::Proxy(state) => state.process(message),
        }
    }

    pub async fn postprocess(&self) -> Result<Vec<(String, Message)>> {
        match &self.kind {
            NodeKind::Wps(state) => state.postprocess().await,
            NodeKind::ParallelWps(_) | NodeKind::Proxy(_) => Ok(Vec::new()),
            NodeKind::Map(state) => state.postprocess(),
            NodeKind::Reduce(state) => state.postprocess(),
        }
    }
}

/// Stamps the originating task name onto a message before it leaves a node.
pub(crate) fn stamp(mut message: Message, task_name: &str) -> Message {
    message.headers.insert(HEADER_TASK_NAME.to_owned(), task_name.to_owned());
    message
}
