use std::{collections::HashMap, sync::Arc};

use log::{error, info};
use workflow_engine::{run, JournalMonitor, Workflow};

#[tokio::main]
async fn main() -> common::error::EmResult<()> {
    log4rs::init_file("workflow-engine/we_run_workflow_log.yml", Default::default()).unwrap();

    let Some(path) = std::env::args().nth(1) else {
        error!("usage: we_run_workflow <workflow.json|workflow.yaml>");
        return Ok(());
    };

    let text = common::fs::read_file(&path).await?;
    let workflow = if path.ends_with(".yaml") || path.ends_with(".yml") {
        Workflow::from_yaml_str(&text)
    } else {
        Workflow::from_json_str(&text)
    };
    let workflow = match workflow {
        Ok(workflow) => workflow,
        Err(error) => {
            error!("{error}");
            return Ok(());
        }
    };

    let headers = collect_header_env_vars();
    let monitor = Arc::new(JournalMonitor::new());

    info!("Running workflow `{}`", workflow.name);
    match run(&workflow, monitor, headers).await {
        Ok(summary) => {
            info!("Workflow `{}` completed", workflow.name);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Err(error) => error!("{error}"),
    }
    Ok(())
}

/// Any `WE_HEADER_<NAME>` environment variable is forwarded as an `<NAME>` header on every
/// outbound WPS request, the mechanism operators use to pass auth tokens to `we_run_workflow`
/// without putting them in the workflow description itself.
fn collect_header_env_vars() -> HashMap<String, String> {
    const PREFIX: &str = "WE_HEADER_";
    std::env::vars()
        .filter_map(|(key, value)| key.strip_prefix(PREFIX).map(|name| (name.to_owned(), value)))
        .collect()
}
