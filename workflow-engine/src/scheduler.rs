//! Scheduler (C7): runs a compiled graph by spawning one tokio task per node instance and wiring
//! their input/output channels according to the resolved edges. Channels close themselves in
//! dependency order: a node's outgoing `Sender` clones live only inside its own worker task, so
//! once every upstream producer of a node finishes, that node's receiver naturally yields `None`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::{
    error::{Error, Result},
    graph::{stamp, Edge, TaskNode},
    message::{Message, Payload, DUMMY_INPUT_NAME},
    monitor::WorkflowMonitor,
};

const CHANNEL_CAPACITY: usize = 64;

pub struct Scheduler;

impl Scheduler {
    /// Runs every node to completion. Returns [`Error::WorkflowFailed`] if any node reported an
    /// exception along the way; the monitor still records every task result that did complete.
    pub async fn run(nodes: Vec<Arc<TaskNode>>, edges: Vec<Edge>, monitor: Arc<dyn WorkflowMonitor>) -> Result<()> {
        let mut channels: HashMap<String, (mpsc::Sender<(String, Message)>, Arc<AsyncMutex<mpsc::Receiver<(String, Message)>>>)> =
            HashMap::new();
        for node in &nodes {
            let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
            channels.insert(node.id.clone(), (sender, Arc::new(AsyncMutex::new(receiver))));
        }

        let mut outgoing: HashMap<String, Vec<(Edge, mpsc::Sender<(String, Message)>)>> = HashMap::new();
        for edge in &edges {
            let Some((sender, _)) = channels.get(&edge.to_id) else {
                return Err(Error::WorkflowInvalid(format!("edge targets unknown node `{}`", edge.to_id)));
            };
            outgoing.entry(edge.from_id.clone()).or_default().push((edge.clone(), sender.clone()));
        }

        let failed = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for node in &nodes {
            let (bootstrap_sender, receiver) = channels.get(&node.id).expect("every node has a registered channel");
            if node.is_source() {
                bootstrap_sender
                    .send((DUMMY_INPUT_NAME.to_owned(), Message::new(Payload::dummy())))
                    .await
                    .map_err(|_| Error::WorkflowInvalid(format!("task `{}` could not be bootstrapped", node.name)))?;
            }

            for rank in 0..node.replica_count() {
                let node = Arc::clone(node);
                let receiver = Arc::clone(receiver);
                let own_outgoing = outgoing.get(&node.id).cloned().unwrap_or_default();
                let monitor = Arc::clone(&monitor);
                let failed = Arc::clone(&failed);
                handles.push(tokio::spawn(async move {
                    run_node(node, rank, receiver, own_outgoing, monitor, failed).await;
                }));
            }
        }

        // Drop the scheduler's own sender/receiver handles; every channel's real lifetime is now
        // owned by the worker tasks that were just spawned.
        drop(channels);

        for handle in handles {
            let _ = handle.await;
        }

        if failed.load(Ordering::SeqCst) {
            let exceptions = monitor.exceptions();
            let message = format!(
                "{} exception(s) raised:\n{}\n\nWorkflow log:\n{}",
                exceptions.len(),
                exceptions.join("\n"),
                monitor.log_lines().join("\n"),
            );
            return Err(Error::WorkflowFailed(message));
        }
        Ok(())
    }
}

async fn run_node(
    node: Arc<TaskNode>,
    rank: u32,
    receiver: Arc<AsyncMutex<mpsc::Receiver<(String, Message)>>>,
    outgoing: Vec<(Edge, mpsc::Sender<(String, Message)>)>,
    monitor: Arc<dyn WorkflowMonitor>,
    failed: Arc<AtomicBool>,
) {
    let mut errored = false;
    loop {
        let next = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let Some((input_name, message)) = next else { break };

        match node.process(&input_name, rank, message).await {
            Ok(outputs) => emit(&node.name, outputs, &outgoing).await,
            Err(error) => {
                monitor.raise_exception(&node.name, &error.to_string());
                failed.store(true, Ordering::SeqCst);
                errored = true;
                break;
            }
        }
    }

    // A node that already failed never runs postprocess: there is nothing left to submit, and a
    // partially-filled WPS Task would otherwise raise its own, more confusing error.
    if errored {
        return;
    }

    match node.postprocess().await {
        Ok(outputs) => emit(&node.name, outputs, &outgoing).await,
        Err(error) => {
            monitor.raise_exception(&node.name, &error.to_string());
            failed.store(true, Ordering::SeqCst);
        }
    }
}

async fn emit(task_name: &str, outputs: Vec<(String, Message)>, outgoing: &[(Edge, mpsc::Sender<(String, Message)>)]) {
    for (output_name, message) in outputs {
        for (edge, sender) in outgoing {
            if edge.from_output == output_name {
                let stamped = stamp(message.clone(), task_name);
                let _ = sender.send((edge.to_input.clone(), stamped)).await;
            }
        }
    }
}
