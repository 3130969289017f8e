//! Exercises `workflow_engine::run` end to end against stub WPS servers, covering the
//! describe/execute/poll cycle the unit tests never see together.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use wiremock::{
    matchers::{method, path, query_param},
    Match, Mock, MockServer, Request, Respond, ResponseTemplate,
};
use workflow_engine::{run, JournalMonitor, Workflow};

const LITERAL_ECHO_PROCESS: &str = r#"<ProcessDescriptions>
    <ProcessDescription>
        <DataInputs>
            <Input minOccurs="1" maxOccurs="1">
                <Identifier>x</Identifier>
                <Title>X</Title>
                <LiteralData><DataType>string</DataType></LiteralData>
            </Input>
        </DataInputs>
        <ProcessOutputs>
            <Output>
                <Identifier>z</Identifier>
                <Title>Z</Title>
                <LiteralData><DataType>string</DataType></LiteralData>
            </Output>
        </ProcessOutputs>
    </ProcessDescription>
</ProcessDescriptions>"#;

const JSON_ARRAY_INPUT_PROCESS: &str = r#"<ProcessDescriptions>
    <ProcessDescription>
        <DataInputs>
            <Input minOccurs="1" maxOccurs="1">
                <Identifier>arr</Identifier>
                <Title>Arr</Title>
                <ComplexData>
                    <Default><Format><MimeType>application/json</MimeType></Format></Default>
                </ComplexData>
            </Input>
        </DataInputs>
        <ProcessOutputs>
            <Output>
                <Identifier>result</Identifier>
                <Title>Result</Title>
                <LiteralData><DataType>string</DataType></LiteralData>
            </Output>
        </ProcessOutputs>
    </ProcessDescription>
</ProcessDescriptions>"#;

/// Matches a POST body containing `needle`, used to give each distinct `Execute` submission its
/// own canned response without wiremock ever seeing which map element it belongs to otherwise.
struct BodyContains(String);

impl Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(&self.0)
    }
}

/// Returns `failing_status` for the first `failures_left` requests, then `recovered_status`
/// forever after. Used to simulate a status endpoint that flakes before recovering.
struct FlakyThenRecovers {
    failures_left: AtomicU32,
    failing_status: u16,
    recovered_body: String,
}

impl Respond for FlakyThenRecovers {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let had_failure_left = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if had_failure_left {
            ResponseTemplate::new(self.failing_status)
        } else {
            ResponseTemplate::new(200).set_body_string(self.recovered_body.clone())
        }
    }
}

/// Restores an environment variable's prior value (or removes it) when dropped, so a test that
/// overrides `PollTiming` for speed doesn't leak its settings into tests that run after it.
struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    fn set(key: &'static str, value: &str) -> Self {
        let previous = std::env::var(key).ok();
        // SAFETY: these tests run under `#[tokio::test]`, each with its own single-threaded
        // runtime, and nothing else in this process reads these particular `WE_*` variables
        // except `PollTiming::from_env`, called synchronously from within `run()`.
        unsafe { std::env::set_var(key, value) };
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        // SAFETY: see `EnvGuard::set`.
        unsafe {
            match &self.previous {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }
}

const LITERAL_INPUT_JSON_OUTPUT_PROCESS: &str = r#"<ProcessDescriptions>
    <ProcessDescription>
        <DataInputs>
            <Input minOccurs="1" maxOccurs="1">
                <Identifier>x</Identifier>
                <Title>X</Title>
                <LiteralData><DataType>string</DataType></LiteralData>
            </Input>
        </DataInputs>
        <ProcessOutputs>
            <Output>
                <Identifier>y</Identifier>
                <Title>Y</Title>
                <ComplexData>
                    <Default><Format><MimeType>application/json</MimeType></Format></Default>
                </ComplexData>
            </Output>
        </ProcessOutputs>
    </ProcessDescription>
</ProcessDescriptions>"#;

const BOUNDING_BOX_INPUT_PROCESS: &str = r#"<ProcessDescriptions>
    <ProcessDescription>
        <DataInputs>
            <Input minOccurs="1" maxOccurs="1">
                <Identifier>bbox</Identifier>
                <Title>BBox</Title>
                <BoundingBoxData>
                    <Default><CRS>EPSG:4326</CRS></Default>
                </BoundingBoxData>
            </Input>
        </DataInputs>
        <ProcessOutputs>
            <Output>
                <Identifier>z</Identifier>
                <Title>Z</Title>
                <LiteralData><DataType>string</DataType></LiteralData>
            </Output>
        </ProcessOutputs>
    </ProcessDescription>
</ProcessDescriptions>"#;

fn succeeded_json_output_response(status_location: &str) -> String {
    format!(
        r#"<ExecuteResponse statusLocation="{status_location}">
            <Status><ProcessSucceeded>done</ProcessSucceeded></Status>
            <ProcessOutputs>
                <Output>
                    <Identifier>y</Identifier>
                    <Title>Y</Title>
                    <ComplexData mimeType="application/json"><![CDATA[{{"ok":true}}]]></ComplexData>
                </Output>
            </ProcessOutputs>
        </ExecuteResponse>"#
    )
}

async fn mount_describe(server: &MockServer, body: &str) {
    Mock::given(method("GET"))
        .and(query_param("request", "DescribeProcess"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn runs_single_task_workflow_to_completion() {
    let server = MockServer::start().await;
    mount_describe(&server, LITERAL_INPUT_JSON_OUTPUT_PROCESS).await;

    let status_location = format!("{}/status/1", server.uri());
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(succeeded_json_output_response(&status_location)))
        .mount(&server)
        .await;

    let workflow_json = format!(
        r#"{{"name":"w","tasks":[{{"name":"A","url":"{}","identifier":"p","inputs":{{"x":"1"}}}}]}}"#,
        server.uri()
    );
    let workflow = Workflow::from_json_str(&workflow_json).expect("valid workflow");
    let monitor = Arc::new(JournalMonitor::new());

    let summary = run(&workflow, monitor, HashMap::new()).await.expect("workflow completes");
    assert_eq!(summary.tasks.len(), 1);
    assert_eq!(summary.tasks[0].name, "A");
    assert_eq!(summary.tasks[0].executions[0].status, "ProcessSucceeded");
}

#[tokio::test]
async fn two_task_chain_adapts_inline_value() {
    let upstream = MockServer::start().await;
    mount_describe(&upstream, LITERAL_INPUT_JSON_OUTPUT_PROCESS).await;
    let upstream_status = format!("{}/status/1", upstream.uri());
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(succeeded_json_output_response(&upstream_status)))
        .mount(&upstream)
        .await;

    let downstream = MockServer::start().await;
    mount_describe(&downstream, BOUNDING_BOX_INPUT_PROCESS).await;
    let downstream_status = format!("{}/status/1", downstream.uri());
    let downstream_success = format!(
        r#"<ExecuteResponse statusLocation="{downstream_status}">
            <Status><ProcessSucceeded>done</ProcessSucceeded></Status>
            <ProcessOutputs>
                <Output>
                    <Identifier>z</Identifier>
                    <Title>Z</Title>
                    <LiteralData>done</LiteralData>
                </Output>
            </ProcessOutputs>
        </ExecuteResponse>"#
    );
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(downstream_success))
        .mount(&downstream)
        .await;

    // B declares a bounding-box input, so A's JSON output cannot be adapted into it: the run must
    // fail before B ever reaches the remote server.
    let workflow_json = format!(
        r#"{{
            "name":"w",
            "tasks":[
                {{"name":"A","url":"{}","identifier":"p1","inputs":{{"x":"1"}}}},
                {{"name":"B","url":"{}","identifier":"p2","linked_inputs":{{"bbox":{{"task":"A","output":"y"}}}}}}
            ]
        }}"#,
        upstream.uri(),
        downstream.uri()
    );
    let workflow = Workflow::from_json_str(&workflow_json).expect("valid workflow");
    let monitor = Arc::new(JournalMonitor::new());

    let error = run(&workflow, monitor, HashMap::new()).await.unwrap_err();
    assert!(matches!(error, workflow_engine::Error::WorkflowFailed(_)));
}

#[tokio::test]
async fn unresolved_link_fails_before_any_execute_call() {
    let server = MockServer::start().await;
    mount_describe(&server, LITERAL_INPUT_JSON_OUTPUT_PROCESS).await;
    // No Execute mock is registered: if the builder ever tried to submit, the test would hang on
    // a connection refused rather than failing cleanly, which would also be a failure.

    let workflow_json = format!(
        r#"{{
            "name":"w",
            "tasks":[{{
                "name":"A",
                "url":"{}",
                "identifier":"p",
                "linked_inputs":{{"x":{{"task":"ghost"}}}}
            }}]
        }}"#,
        server.uri()
    );
    let workflow = Workflow::from_json_str(&workflow_json).expect("schema is valid");
    let monitor = Arc::new(JournalMonitor::new());

    let error = run(&workflow, monitor, HashMap::new()).await.unwrap_err();
    assert!(matches!(error, workflow_engine::Error::WorkflowInvalid(message) if message.contains("ghost")));
}

/// The documented parallel-group happy path: a literal map fans out over three elements, the
/// group's member task runs one execution per element across two replicas, and the reduce
/// reassembles them back into a single array in ascending map-index order regardless of the
/// descending emission order or which replica happened to pick up which element. This is exactly
/// the scenario that silently corrupted itself when Map and Reduce shared a scheduler channel.
#[tokio::test]
async fn parallel_group_maps_and_reduces_in_index_order() {
    let member_server = MockServer::start().await;
    mount_describe(&member_server, LITERAL_ECHO_PROCESS).await;
    for (input, output) in [("1", "one"), ("2", "two"), ("3", "three")] {
        let status_location = format!("{}/status/{input}", member_server.uri());
        let response = format!(
            r#"<ExecuteResponse statusLocation="{status_location}">
                <Status><ProcessSucceeded>done</ProcessSucceeded></Status>
                <ProcessOutputs>
                    <Output>
                        <Identifier>z</Identifier>
                        <Title>Z</Title>
                        <LiteralData>{output}</LiteralData>
                    </Output>
                </ProcessOutputs>
            </ExecuteResponse>"#
        );
        Mock::given(method("POST"))
            .and(BodyContains(format!("<LiteralData>{input}</LiteralData>")))
            .respond_with(ResponseTemplate::new(200).set_body_string(response))
            .mount(&member_server)
            .await;
    }

    let downstream_server = MockServer::start().await;
    mount_describe(&downstream_server, JSON_ARRAY_INPUT_PROCESS).await;
    let downstream_status = format!("{}/status/1", downstream_server.uri());
    let downstream_response = format!(
        r#"<ExecuteResponse statusLocation="{downstream_status}">
            <Status><ProcessSucceeded>done</ProcessSucceeded></Status>
            <ProcessOutputs>
                <Output>
                    <Identifier>result</Identifier>
                    <Title>Result</Title>
                    <LiteralData>ok</LiteralData>
                </Output>
            </ProcessOutputs>
        </ExecuteResponse>"#
    );
    Mock::given(method("POST"))
        .and(BodyContains(r#"["one","two","three"]"#.to_owned()))
        .respond_with(ResponseTemplate::new(200).set_body_string(downstream_response))
        .mount(&downstream_server)
        .await;

    let workflow_json = format!(
        r#"{{
            "name":"w",
            "tasks":[{{
                "name":"C",
                "url":"{downstream}",
                "identifier":"p2",
                "linked_inputs":{{"arr":{{"task":"G","output":"reduce_out"}}}}
            }}],
            "parallel_groups":[{{
                "name":"G",
                "max_processes":2,
                "map":["1","2","3"],
                "reduce":{{"task":"B"}},
                "tasks":[{{
                    "name":"B",
                    "url":"{member}",
                    "identifier":"p1",
                    "linked_inputs":{{"x":{{"task":"G","output":"map_out"}}}}
                }}]
            }}]
        }}"#,
        downstream = downstream_server.uri(),
        member = member_server.uri()
    );
    let workflow = Workflow::from_json_str(&workflow_json).expect("valid workflow");
    let monitor = Arc::new(JournalMonitor::new());

    let summary = run(&workflow, monitor, HashMap::new()).await.expect("workflow completes");

    let member_summary = summary.tasks.iter().find(|entry| entry.name == "B").expect("B ran");
    assert_eq!(member_summary.executions.len(), 3);

    let downstream_summary = summary.tasks.iter().find(|entry| entry.name == "C").expect("C ran");
    assert_eq!(downstream_summary.executions.len(), 1);
    assert_eq!(downstream_summary.executions[0].status, "ProcessSucceeded");
}

/// A status endpoint that fails a couple of times before recovering stays within the retry
/// budget and the workflow still completes.
#[tokio::test]
async fn status_poll_recovers_after_transient_failures() {
    let _poll_delay = EnvGuard::set("WE_POLL_DELAY_SECS", "0");
    let _retry_delay = EnvGuard::set("WE_RETRY_DELAY_SECS", "0");

    let server = MockServer::start().await;
    mount_describe(&server, LITERAL_INPUT_JSON_OUTPUT_PROCESS).await;

    let status_location = format!("{}/status/1", server.uri());
    let accepted_response = format!(
        r#"<ExecuteResponse statusLocation="{status_location}">
            <Status><ProcessAccepted>queued</ProcessAccepted></Status>
        </ExecuteResponse>"#
    );
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(accepted_response))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/1"))
        .respond_with(FlakyThenRecovers {
            failures_left: AtomicU32::new(2),
            failing_status: 500,
            recovered_body: succeeded_json_output_response(&status_location),
        })
        .mount(&server)
        .await;

    let workflow_json = format!(
        r#"{{"name":"w","tasks":[{{"name":"A","url":"{}","identifier":"p","inputs":{{"x":"1"}}}}]}}"#,
        server.uri()
    );
    let workflow = Workflow::from_json_str(&workflow_json).expect("valid workflow");
    let monitor = Arc::new(JournalMonitor::new());

    let summary = run(&workflow, monitor, HashMap::new()).await.expect("recovers within the retry budget");
    assert_eq!(summary.tasks[0].executions[0].status, "ProcessSucceeded");
}

/// A status endpoint that never recovers exceeds the retry budget and surfaces
/// `StatusReadFailed`, aggregated into the workflow's failure message.
#[tokio::test]
async fn status_poll_gives_up_after_exceeding_retry_budget() {
    let _poll_delay = EnvGuard::set("WE_POLL_DELAY_SECS", "0");
    let _retry_delay = EnvGuard::set("WE_RETRY_DELAY_SECS", "0");
    let _max_retries = EnvGuard::set("WE_MAX_RETRIES", "1");

    let server = MockServer::start().await;
    mount_describe(&server, LITERAL_INPUT_JSON_OUTPUT_PROCESS).await;

    let status_location = format!("{}/status/1", server.uri());
    let accepted_response = format!(
        r#"<ExecuteResponse statusLocation="{status_location}">
            <Status><ProcessAccepted>queued</ProcessAccepted></Status>
        </ExecuteResponse>"#
    );
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(accepted_response))
        .mount(&server)
        .await;
    Mock::given(method("GET")).and(path("/status/1")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let workflow_json = format!(
        r#"{{"name":"w","tasks":[{{"name":"A","url":"{}","identifier":"p","inputs":{{"x":"1"}}}}]}}"#,
        server.uri()
    );
    let workflow = Workflow::from_json_str(&workflow_json).expect("valid workflow");
    let monitor = Arc::new(JournalMonitor::new());

    let error = run(&workflow, monitor, HashMap::new()).await.unwrap_err();
    let workflow_engine::Error::WorkflowFailed(message) = error else {
        panic!("expected WorkflowFailed, got {error:?}");
    };
    assert!(message.contains("1 exception(s) raised"));
    assert!(message.contains("Could not read status document"));
    assert!(message.contains("Workflow log:"));
}
