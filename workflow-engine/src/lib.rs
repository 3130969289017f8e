pub mod adapter;
pub mod error;
pub mod graph;
pub mod message;
pub mod monitor;
pub mod progress;
pub mod scheduler;
pub mod workflow;
pub mod wps;

pub use error::{Error, Result};
pub use monitor::{JournalMonitor, OutputRecord, Summary, TaskResultRecord, TaskSummaryEntry, WorkflowMonitor};
pub use workflow::Workflow;

use std::{collections::HashMap, sync::Arc};

use graph::GraphBuilder;
use scheduler::Scheduler;
use wps::{PollTiming, ReqwestWpsClient, WpsClient};

/// Compiles `workflow` into a graph and runs it to completion, returning the final summary.
/// `headers` are attached to every outbound `Execute` request (useful for auth tokens the remote
/// processes require).
pub async fn run(workflow: &Workflow, monitor: Arc<dyn WorkflowMonitor>, headers: HashMap<String, String>) -> Result<Summary> {
    workflow.validate()?;

    let client: Arc<dyn WpsClient> = Arc::new(ReqwestWpsClient::new());
    let timing = PollTiming::from_env()?;
    let http = reqwest::Client::new();

    let (nodes, edges) = GraphBuilder::build(workflow, Arc::clone(&client), timing, http, Arc::clone(&monitor), headers).await?;
    Scheduler::run(nodes, edges, Arc::clone(&monitor)).await?;

    Ok(monitor.summary(&workflow.task_names()))
}
