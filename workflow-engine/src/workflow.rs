//! User-supplied workflow description and its schema validation.
//!
//! A [`Workflow`] is deserialized straight off the wire (JSON is canonical, YAML an alternate
//! surface syntax of the same schema) with `deny_unknown_fields` doing the closed-vocabulary
//! enforcement the schema calls for. What `serde` cannot express — uniqueness of task names,
//! resolvability of linked inputs, bounds on `progress_range` — is checked by [`Workflow::validate`]
//! once deserialization succeeds.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level workflow description.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroupSpec>,
}

/// One plain (non-parallel) task entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub name: String,
    pub url: String,
    pub identifier: String,
    #[serde(default)]
    pub inputs: HashMap<String, OneOrMany<String>>,
    #[serde(default)]
    pub linked_inputs: HashMap<String, OneOrMany<InputRef>>,
    #[serde(default = "default_progress_range")]
    pub progress_range: [u8; 2],
}

fn default_progress_range() -> [u8; 2] {
    [0, 100]
}

/// A value that may be supplied either bare or as a list in the workflow JSON/YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// Points at another task's output.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputRef {
    pub task: String,
    pub output: Option<String>,
    #[serde(default)]
    pub as_reference: bool,
}

/// The array an inner parallel task is fanned out over: either produced dynamically by an
/// upstream task, or given as a literal list right in the workflow description.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MapSource {
    Linked(InputRef),
    Literal(Vec<String>),
}

/// A group of tasks replicated over the elements of `map`, with `reduce` naming the upstream
/// whose per-element outputs the group's Reduce collects.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelGroupSpec {
    pub name: String,
    pub max_processes: u32,
    pub map: MapSource,
    pub reduce: InputRef,
    pub tasks: Vec<TaskSpec>,
}

impl Workflow {
    /// Parse and validate a workflow description from its canonical JSON form.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let workflow: Self = serde_json::from_str(text).map_err(common::error::EmError::from)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Parse and validate a workflow description from the YAML surface syntax.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let workflow: Self = serde_yaml::from_str(text).map_err(common::error::EmError::from)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Every plain task in declaration order, followed by the Map, Reduce and inner tasks of
    /// each parallel group in declaration order. This is also the order the Graph Builder
    /// instantiates nodes in.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|task| task.name.clone()).collect();
        for group in &self.parallel_groups {
            names.push(group.name.clone());
            for task in &group.tasks {
                names.push(task.name.clone());
            }
        }
        names
    }

    /// Checks that cannot be expressed by `serde` alone: at least one task source, unique names,
    /// sane progress ranges, non-empty groups.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() && self.parallel_groups.is_empty() {
            return Err(Error::WorkflowInvalid(
                "workflow must declare at least one task or parallel group".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            validate_progress_range(&task.name, task.progress_range)?;
            if !seen.insert(task.name.clone()) {
                return Err(Error::WorkflowInvalid(format!(
                    "duplicate task name `{}`",
                    task.name
                )));
            }
        }
        for group in &self.parallel_groups {
            if group.max_processes == 0 {
                return Err(Error::WorkflowInvalid(format!(
                    "parallel group `{}` must allow at least one process",
                    group.name
                )));
            }
            if group.tasks.is_empty() {
                return Err(Error::WorkflowInvalid(format!(
                    "parallel group `{}` must declare at least one task",
                    group.name
                )));
            }
            if !seen.insert(group.name.clone()) {
                return Err(Error::WorkflowInvalid(format!(
                    "duplicate task name `{}`",
                    group.name
                )));
            }
            for task in &group.tasks {
                validate_progress_range(&task.name, task.progress_range)?;
                if task.linked_inputs.values().map(|refs| refs_len(refs)).sum::<usize>() > 1 {
                    return Err(Error::WorkflowInvalid(format!(
                        "parallel task `{}` may declare at most one linked input",
                        task.name
                    )));
                }
                for reference in task.linked_inputs.values().flat_map(refs_iter) {
                    if reference.task != group.name {
                        return Err(Error::WorkflowInvalid(format!(
                            "parallel task `{}` may only link to its own group `{}`, not `{}`",
                            task.name, group.name, reference.task
                        )));
                    }
                }
                if !seen.insert(task.name.clone()) {
                    return Err(Error::WorkflowInvalid(format!(
                        "duplicate task name `{}`",
                        task.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn refs_len(refs: &OneOrMany<InputRef>) -> usize {
    match refs {
        OneOrMany::One(_) => 1,
        OneOrMany::Many(values) => values.len(),
    }
}

fn refs_iter(refs: &OneOrMany<InputRef>) -> Vec<&InputRef> {
    match refs {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values.iter().collect(),
    }
}

fn validate_progress_range(task_name: &str, range: [u8; 2]) -> Result<()> {
    if range[0] >= range[1] || range[1] > 100 {
        return Err(Error::WorkflowInvalid(format!(
            "task `{task_name}` has an invalid progress_range {range:?}, expected 0 <= start < \
             end <= 100"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_fields() {
        let text = r#"{"name":"w","tasks":[{"name":"A","url":"u","identifier":"p","bogus":1}]}"#;
        assert!(Workflow::from_json_str(text).is_err());
    }

    #[test]
    fn rejects_empty_workflow() {
        let text = r#"{"name":"w"}"#;
        let error = Workflow::from_json_str(text).unwrap_err();
        assert!(matches!(error, Error::WorkflowInvalid(_)));
    }

    #[test]
    fn rejects_duplicate_task_names() {
        let text = r#"{
            "name":"w",
            "tasks":[
                {"name":"A","url":"u","identifier":"p"},
                {"name":"A","url":"u","identifier":"p"}
            ]
        }"#;
        let error = Workflow::from_json_str(text).unwrap_err();
        assert!(matches!(error, Error::WorkflowInvalid(_)));
    }

    #[test]
    fn accepts_minimal_single_task_workflow() {
        let text = r#"{
            "name":"w",
            "tasks":[{"name":"A","url":"u","identifier":"p","inputs":{"x":"1"}}]
        }"#;
        let workflow = Workflow::from_json_str(text).expect("valid workflow");
        assert_eq!(workflow.task_names(), vec!["A".to_owned()]);
    }

    #[test]
    fn parses_yaml_surface_syntax() {
        let text = "name: w\ntasks:\n  - name: A\n    url: u\n    identifier: p\n";
        let workflow = Workflow::from_yaml_str(text).expect("valid workflow");
        assert_eq!(workflow.name, "w");
    }

    #[test]
    fn rejects_parallel_task_with_two_linked_inputs() {
        let text = r#"{
            "name":"w",
            "parallel_groups":[{
                "name":"G",
                "max_processes":2,
                "map":{"task":"A"},
                "reduce":{"task":"B"},
                "tasks":[{
                    "name":"B",
                    "url":"u",
                    "identifier":"p",
                    "linked_inputs":{"a":{"task":"A"},"b":{"task":"C"}}
                }]
            }]
        }"#;
        let error = Workflow::from_json_str(text).unwrap_err();
        assert!(matches!(error, Error::WorkflowInvalid(_)));
    }

    #[test]
    fn rejects_parallel_task_linked_to_a_task_outside_its_own_group() {
        let text = r#"{
            "name":"w",
            "tasks":[{"name":"A","url":"u","identifier":"p"}],
            "parallel_groups":[{
                "name":"G",
                "max_processes":2,
                "map":{"task":"A"},
                "reduce":{"task":"B"},
                "tasks":[{
                    "name":"B",
                    "url":"u",
                    "identifier":"p",
                    "linked_inputs":{"a":{"task":"A"}}
                }]
            }]
        }"#;
        let error = Workflow::from_json_str(text).unwrap_err();
        assert!(matches!(error, Error::WorkflowInvalid(_)));
    }
}
