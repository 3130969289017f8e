//! Graph Builder (C6): turns a parsed [`Workflow`] into the flat list of [`TaskNode`]s and
//! [`Edge`]s the scheduler runs. Fetches every referenced process's description up front so a bad
//! remote identifier or an incompatible datatype is caught before any execution starts.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use super::{
    map_reduce::{MapState, ReduceState},
    proxy::ProxyState,
    wps_task::{LinkedInput, ParallelWpsState, WpsState},
    Edge, NodeKind, TaskNode,
};
use crate::{
    error::{Error, Result},
    message::DUMMY_INPUT_NAME,
    monitor::WorkflowMonitor,
    progress::{RangeGroupProgress, RangeProgress},
    workflow::{InputRef, MapSource, OneOrMany, TaskSpec, Workflow},
    wps::{PollTiming, ProcessDescription, WpsClient},
};

/// A plain or parallel-member task, flattened out of `Workflow::tasks` and every
/// `ParallelGroupSpec::tasks`, with its remote description already fetched.
struct PlainTask {
    spec: TaskSpec,
    description: Arc<ProcessDescription>,
    is_parallel: bool,
    max_processes: u32,
}

/// What one named producer in the workflow can be connected to: either a remote process
/// description (for output-name validation and defaulting), or a parallel group, whose Map and
/// Reduce share the group's name and are disambiguated by the explicit output name a link asks
/// for (`map_out` or `reduce_out`).
enum Producer<'a> {
    Wps(&'a ProcessDescription),
    Group,
}

/// Suffix applied to a parallel group's name to build the Map node's unique id.
const MAP_ID_SUFFIX: &str = "#map";
/// Suffix applied to a parallel group's name to build the Reduce node's unique id.
const REDUCE_ID_SUFFIX: &str = "#reduce";

impl Producer<'_> {
    fn resolve_output(&self, requested: Option<&str>, task_name: &str) -> Result<String> {
        match self {
            Self::Wps(description) => match requested {
                Some(name) => {
                    if description.output(name).is_none() {
                        return Err(Error::WorkflowInvalid(format!("task `{task_name}` has no output named `{name}`")));
                    }
                    Ok(name.to_owned())
                }
                None if description.outputs.len() == 1 => Ok(description.outputs[0].identifier.clone()),
                None => Err(Error::WorkflowInvalid(format!(
                    "link to task `{task_name}` must name an `output`: it declares more than one"
                ))),
            },
            Self::Group => requested.map(str::to_owned).ok_or_else(|| {
                Error::WorkflowInvalid(format!(
                    "link to parallel group `{task_name}` must name an `output` (`map_out` or `reduce_out`)"
                ))
            }),
        }
    }

    /// The unique node id this producer's `output` actually lives on. A Wps producer has exactly
    /// one node, so `task_name` is already unique; a Group producer's Map and Reduce share
    /// `task_name`, so the output name (already validated by `resolve_output`) picks the node.
    fn node_id(&self, task_name: &str, output: &str) -> String {
        match self {
            Self::Wps(_) => task_name.to_owned(),
            Self::Group if output == "map_out" => format!("{task_name}{MAP_ID_SUFFIX}"),
            Self::Group => format!("{task_name}{REDUCE_ID_SUFFIX}"),
        }
    }
}

fn producer_for<'a>(
    descriptions: &'a HashMap<String, Arc<ProcessDescription>>,
    workflow: &Workflow,
    name: &str,
) -> Result<Producer<'a>> {
    if let Some(description) = descriptions.get(name) {
        return Ok(Producer::Wps(description.as_ref()));
    }
    if workflow.parallel_groups.iter().any(|group| group.name == name) {
        return Ok(Producer::Group);
    }
    Err(Error::WorkflowInvalid(format!("link references unknown task `{name}`")))
}

/// Resolution state threaded through every `connect_edge` call.
struct Resolution {
    edges: Vec<Edge>,
    requested_outputs: HashMap<String, Vec<(String, bool)>>,
    linked_as_reference: HashMap<(String, String), bool>,
    seen_pairs: HashSet<(String, String)>,
    proxies: Vec<(String, String, String)>,
    proxy_count: u32,
}

impl Resolution {
    fn new() -> Self {
        Self {
            edges: Vec::new(),
            requested_outputs: HashMap::new(),
            linked_as_reference: HashMap::new(),
            seen_pairs: HashSet::new(),
            proxies: Vec::new(),
            proxy_count: 0,
        }
    }

    /// `to_id`/`to_task` are usually the same value; they differ only when the destination is a
    /// group's Map or Reduce node (`to_id` then carries the `#map`/`#reduce` suffix) while
    /// `to_task` stays the bookkeeping key used by `requested_outputs`/`linked_as_reference`
    /// (which only plain/parallel Wps tasks ever consult, so they never see a suffixed id).
    fn connect(
        &mut self,
        descriptions: &HashMap<String, Arc<ProcessDescription>>,
        workflow: &Workflow,
        reference: &InputRef,
        to_task: &str,
        to_id: &str,
        to_input: &str,
    ) -> Result<()> {
        let producer = producer_for(descriptions, workflow, &reference.task)?;
        let output = producer.resolve_output(reference.output.as_deref(), &reference.task)?;
        let from_id = producer.node_id(&reference.task, &output);

        self.requested_outputs
            .entry(reference.task.clone())
            .or_default()
            .push((output.clone(), reference.as_reference));
        self.linked_as_reference
            .insert((to_task.to_owned(), to_input.to_owned()), reference.as_reference);

        let pair = (from_id.clone(), to_id.to_owned());
        if self.seen_pairs.insert(pair) {
            self.edges.push(Edge {
                from_id,
                from_output: output,
                to_id: to_id.to_owned(),
                to_input: to_input.to_owned(),
            });
        } else {
            self.proxy_count += 1;
            let proxy_name = format!("__proxy_{}_{}_{}", reference.task, to_task, self.proxy_count);
            self.proxies.push((proxy_name.clone(), from_id, output));
            self.edges.push(Edge {
                from_id: proxy_name,
                from_output: "proxy_out".to_owned(),
                to_id: to_id.to_owned(),
                to_input: to_input.to_owned(),
            });
        }
        Ok(())
    }
}

pub struct GraphBuilder;

impl GraphBuilder {
    /// Compiles `workflow` into nodes and edges, fetching every referenced process description
    /// through `client`.
    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        workflow: &Workflow,
        client: Arc<dyn WpsClient>,
        timing: PollTiming,
        http: reqwest::Client,
        monitor: Arc<dyn WorkflowMonitor>,
        headers: HashMap<String, String>,
    ) -> Result<(Vec<Arc<TaskNode>>, Vec<Edge>)> {
        let mut plain_tasks = Vec::new();
        for spec in &workflow.tasks {
            plain_tasks.push(Self::describe(&client, spec.clone(), false, 1).await?);
        }
        for group in &workflow.parallel_groups {
            for spec in &group.tasks {
                plain_tasks.push(Self::describe(&client, spec.clone(), true, group.max_processes).await?);
            }
        }

        let mut descriptions: HashMap<String, Arc<ProcessDescription>> = HashMap::new();
        for task in &plain_tasks {
            descriptions.insert(task.spec.name.clone(), Arc::clone(&task.description));
        }
        for task in &plain_tasks {
            validate_linked_input_names(task)?;
        }

        let mut resolution = Resolution::new();

        for task in &plain_tasks {
            for (input_name, refs) in &task.spec.linked_inputs {
                for reference in clone_refs(refs) {
                    resolution.connect(&descriptions, workflow, &reference, &task.spec.name, &task.spec.name, input_name)?;
                }
            }
        }
        for group in &workflow.parallel_groups {
            let map_id = format!("{}{MAP_ID_SUFFIX}", group.name);
            let reduce_id = format!("{}{REDUCE_ID_SUFFIX}", group.name);
            if let MapSource::Linked(reference) = &group.map {
                resolution.connect(&descriptions, workflow, reference, &group.name, &map_id, "map_in")?;
            }
            resolution.connect(&descriptions, workflow, &group.reduce, &group.name, &reduce_id, "reduce_in")?;
        }

        // Every inner task of a group implicitly consumes the group's Map output, unless it
        // already declared an explicit linked input naming the group.
        for group in &workflow.parallel_groups {
            for spec in &group.tasks {
                let already_linked = spec
                    .linked_inputs
                    .values()
                    .flat_map(|refs| clone_refs(refs).into_iter())
                    .any(|reference| reference.task == group.name);
                if !already_linked {
                    let reference = InputRef { task: group.name.clone(), output: Some("map_out".to_owned()), as_reference: false };
                    resolution.connect(&descriptions, workflow, &reference, &spec.name, &spec.name, DUMMY_INPUT_NAME)?;
                }
            }
        }

        let Resolution { mut edges, mut requested_outputs, linked_as_reference, proxies, .. } = resolution;

        let mut nodes = Vec::new();
        for task in plain_tasks {
            let outputs = requested_outputs.remove(&task.spec.name).unwrap_or_default();
            let static_inputs = flatten_static_inputs(&task.spec);
            let progress_range = RangeProgress::new(task.spec.progress_range[0], task.spec.progress_range[1]);
            let linked: Vec<LinkedInput> = task
                .spec
                .linked_inputs
                .keys()
                .map(|name| LinkedInput {
                    name: name.clone(),
                    as_reference: linked_as_reference.get(&(task.spec.name.clone(), name.clone())).copied().unwrap_or(false),
                })
                .collect();

            if task.is_parallel {
                let linked_input = linked.into_iter().next();
                let state = ParallelWpsState {
                    name: task.spec.name.clone(),
                    max_processes: task.max_processes,
                    url: task.spec.url.clone(),
                    identifier: task.spec.identifier.clone(),
                    description: Arc::clone(&task.description),
                    static_inputs,
                    linked_input,
                    requested_outputs: outputs,
                    group_progress: RangeGroupProgress::new(progress_range),
                    client: Arc::clone(&client),
                    timing,
                    http: http.clone(),
                    monitor: Arc::clone(&monitor),
                    headers: headers.clone(),
                };
                nodes.push(Arc::new(TaskNode::new(task.spec.name.clone(), task.spec.name.clone(), NodeKind::ParallelWps(state))));
            } else {
                let state = WpsState::new(
                    task.spec.name.clone(),
                    task.spec.url.clone(),
                    task.spec.identifier.clone(),
                    Arc::clone(&task.description),
                    static_inputs,
                    linked,
                    outputs,
                    progress_range,
                    Arc::clone(&client),
                    timing,
                    http.clone(),
                    Arc::clone(&monitor),
                    headers.clone(),
                );
                nodes.push(Arc::new(TaskNode::new(task.spec.name.clone(), task.spec.name.clone(), NodeKind::Wps(state))));
            }
        }

        for group in &workflow.parallel_groups {
            let literal_list = match &group.map {
                MapSource::Literal(values) => Some(values.clone()),
                MapSource::Linked(_) => None,
            };
            nodes.push(Arc::new(TaskNode::new(
                format!("{}{MAP_ID_SUFFIX}", group.name),
                group.name.clone(),
                NodeKind::Map(MapState::new(group.name.clone(), literal_list)),
            )));
            nodes.push(Arc::new(TaskNode::new(
                format!("{}{REDUCE_ID_SUFFIX}", group.name),
                group.name.clone(),
                NodeKind::Reduce(ReduceState::new(group.name.clone())),
            )));
        }

        for (proxy_name, from_id, from_output) in proxies {
            edges.push(Edge {
                from_id,
                from_output,
                to_id: proxy_name.clone(),
                to_input: DUMMY_INPUT_NAME.to_owned(),
            });
            nodes.push(Arc::new(TaskNode::new(proxy_name.clone(), proxy_name, NodeKind::Proxy(ProxyState))));
        }

        Ok((nodes, edges))
    }

    async fn describe(client: &Arc<dyn WpsClient>, spec: TaskSpec, is_parallel: bool, max_processes: u32) -> Result<PlainTask> {
        let description = client.describe(&spec.url, &spec.identifier).await?;
        Ok(PlainTask { spec, description, is_parallel, max_processes })
    }
}

fn validate_linked_input_names(task: &PlainTask) -> Result<()> {
    for name in task.spec.linked_inputs.keys() {
        if name == DUMMY_INPUT_NAME {
            continue;
        }
        if task.description.input(name).is_none() {
            return Err(Error::WorkflowInvalid(format!("task `{}` has no input named `{name}`", task.spec.name)));
        }
    }
    Ok(())
}

fn clone_refs(refs: &OneOrMany<InputRef>) -> Vec<InputRef> {
    refs.clone().into_vec()
}

fn flatten_static_inputs(spec: &TaskSpec) -> Vec<(String, String)> {
    spec.inputs
        .iter()
        .flat_map(|(name, values)| values.clone().into_vec().into_iter().map(move |value| (name.clone(), value)))
        .collect()
}
