//! Workflow monitor: collects status updates, exceptions and task results as a run progresses,
//! and renders the final [`Summary`] returned to the caller.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use log::info;

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// One output value recorded for a completed task execution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OutputRecord {
    pub identifier: String,
    pub mime_type: Option<String>,
    pub reference: Option<String>,
    pub data: Vec<String>,
}

/// One execution of a task: a plain task runs once, a parallel task's inner process runs once per
/// mapped element and carries `data_id`/`process_id` to disambiguate which replica produced it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskResultRecord {
    pub status: String,
    pub status_location: String,
    pub outputs: Vec<OutputRecord>,
    pub data_id: Option<i64>,
    pub process_id: Option<u32>,
}

/// All executions recorded for one task, in the order they completed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSummaryEntry {
    pub name: String,
    pub executions: Vec<TaskResultRecord>,
}

/// Final result of a workflow run: an ordered list keyed by task execution order, not a map, so
/// the order the workflow declared its tasks in survives into the rendered output. `log` is the
/// full timestamped workflow log (every `update_status`/`raise_exception` line), in the order
/// they were recorded.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Summary {
    pub tasks: Vec<TaskSummaryEntry>,
    pub log: Vec<String>,
}

/// Sink for everything the scheduler observes while a workflow runs. Deliberately synchronous:
/// every call here is a cheap, non-blocking append to an in-memory journal, so there is no reason
/// to make callers `.await` it.
pub trait WorkflowMonitor: Send + Sync {
    /// Records a status-message/progress update for `task_name`. `progress` is the already
    /// range-scaled value, or `None` when only the message changed.
    fn update_status(&self, task_name: &str, message: &str, progress: Option<u8>);

    /// Records that `task_name` raised an exception, independent of whether it proves fatal to the
    /// whole workflow.
    fn raise_exception(&self, task_name: &str, message: &str);

    /// Records one completed execution of `task_name`.
    fn save_task_result(&self, task_name: &str, record: TaskResultRecord);

    /// Every status line recorded so far, in the order they were received.
    fn log_lines(&self) -> Vec<String>;

    /// Every exception message recorded so far, in the order they were received.
    fn exceptions(&self) -> Vec<String>;

    /// Renders the final summary, ordering tasks by `task_order` (the order the graph builder
    /// resolved them in).
    fn summary(&self, task_order: &[String]) -> Summary;
}

#[derive(Default)]
struct JournalState {
    log_lines: Vec<String>,
    exceptions: Vec<String>,
    results: HashMap<String, Vec<TaskResultRecord>>,
}

/// Default [`WorkflowMonitor`], logging every update through the `log` facade in addition to
/// journaling it for the final summary.
pub struct JournalMonitor {
    state: Mutex<JournalState>,
}

impl JournalMonitor {
    pub fn new() -> Self {
        Self { state: Mutex::new(JournalState::default()) }
    }
}

impl Default for JournalMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowMonitor for JournalMonitor {
    fn update_status(&self, task_name: &str, message: &str, progress: Option<u8>) {
        let line = match progress {
            Some(percent) => format!("{}{percent:>4}%: [{task_name}] {message}", timestamp()),
            None => format!("{}: [{task_name}] {message}", timestamp()),
        };
        info!("{line}");
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .log_lines
            .push(line);
    }

    fn raise_exception(&self, task_name: &str, message: &str) {
        let line = format!("{}: [{task_name}] {message}", timestamp());
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.log_lines.push(line.clone());
        state.exceptions.push(line);
    }

    fn save_task_result(&self, task_name: &str, record: TaskResultRecord) {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .results
            .entry(task_name.to_owned())
            .or_default()
            .push(record);
    }

    fn log_lines(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).log_lines.clone()
    }

    fn exceptions(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).exceptions.clone()
    }

    fn summary(&self, task_order: &[String]) -> Summary {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tasks = task_order
            .iter()
            .filter_map(|name| {
                state.results.get(name).map(|executions| TaskSummaryEntry {
                    name: name.clone(),
                    executions: executions.clone(),
                })
            })
            .collect();
        Summary { tasks, log: state.log_lines.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_preserves_task_order_and_collects_executions() {
        let monitor = JournalMonitor::new();
        monitor.save_task_result("b", TaskResultRecord {
            status: "ProcessSucceeded".to_owned(),
            status_location: "http://example.test/b".to_owned(),
            outputs: vec![],
            data_id: None,
            process_id: None,
        });
        monitor.save_task_result("a", TaskResultRecord {
            status: "ProcessSucceeded".to_owned(),
            status_location: "http://example.test/a".to_owned(),
            outputs: vec![],
            data_id: Some(0),
            process_id: Some(1),
        });
        monitor.save_task_result("a", TaskResultRecord {
            status: "ProcessSucceeded".to_owned(),
            status_location: "http://example.test/a2".to_owned(),
            outputs: vec![],
            data_id: Some(1),
            process_id: Some(2),
        });

        let summary = monitor.summary(&["a".to_owned(), "b".to_owned()]);
        assert_eq!(summary.tasks.len(), 2);
        assert_eq!(summary.tasks[0].name, "a");
        assert_eq!(summary.tasks[0].executions.len(), 2);
        assert_eq!(summary.tasks[1].name, "b");
    }

    #[test]
    fn raise_exception_is_journaled_and_logged() {
        let monitor = JournalMonitor::new();
        monitor.raise_exception("t1", "boom");
        let exceptions = monitor.exceptions();
        assert_eq!(exceptions.len(), 1);
        assert!(exceptions[0].ends_with(": [t1] boom"));
        assert_eq!(monitor.log_lines(), exceptions);
    }

    #[test]
    fn update_status_lines_are_timestamped_and_feed_the_summary_log() {
        let monitor = JournalMonitor::new();
        monitor.update_status("t1", "started", None);
        monitor.update_status("t1", "halfway", Some(50));

        let log = monitor.log_lines();
        assert_eq!(log.len(), 2);
        assert!(log[0].contains(':') && log[0].ends_with(": [t1] started"));
        assert!(log[1].contains("  50%: [t1] halfway"));

        let summary = monitor.summary(&[]);
        assert_eq!(summary.log, log);
    }
}
