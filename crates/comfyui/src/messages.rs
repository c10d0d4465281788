//! Typed ComfyUI REST payloads.
//!
//! Only the fields the orchestrator reads are modelled; everything else
//! in the server's responses is ignored.

use serde::Deserialize;
use serde_json::Value;

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors; empty on success.
    #[serde(default)]
    pub node_errors: Value,
}

/// One entry of `queue_running` / `queue_pending`.
///
/// ComfyUI encodes entries as arrays:
/// `[number, prompt_id, prompt, extra_data, outputs_to_execute]`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueEntry(pub Vec<Value>);

impl QueueEntry {
    pub fn prompt_id(&self) -> Option<&str> {
        self.0.get(1).and_then(Value::as_str)
    }
}

/// Response of `GET /queue`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<QueueEntry>,
    #[serde(default)]
    pub queue_pending: Vec<QueueEntry>,
}

impl QueueSnapshot {
    /// Queued plus executing prompts.
    pub fn depth(&self) -> u32 {
        (self.queue_running.len() + self.queue_pending.len()) as u32
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.queue_running
            .iter()
            .any(|e| e.prompt_id() == Some(prompt_id))
    }

    pub fn is_pending(&self, prompt_id: &str) -> bool {
        self.queue_pending
            .iter()
            .any(|e| e.prompt_id() == Some(prompt_id))
    }

    /// True while the prompt is still queued or executing.
    pub fn contains(&self, prompt_id: &str) -> bool {
        self.is_running(prompt_id) || self.is_pending(prompt_id)
    }
}

/// What `GET /history/{prompt_id}` says about a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    /// Execution finished; `outputs` is the node output map.
    Success { outputs: Value },
    /// Execution finished with an error.
    Error { message: String },
    /// The prompt has no history entry.
    Unknown,
}

/// Interpret a history response for `prompt_id`.
///
/// The body is an object keyed by prompt id; an empty object means the
/// server has no record of the prompt.
pub fn parse_history(prompt_id: &str, body: &Value) -> PromptOutcome {
    let Some(entry) = body.get(prompt_id) else {
        return PromptOutcome::Unknown;
    };

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str);

    if status_str == Some("error") {
        return PromptOutcome::Error {
            message: execution_error_message(status)
                .unwrap_or_else(|| "Backend reported an execution error".to_string()),
        };
    }

    PromptOutcome::Success {
        outputs: entry.get("outputs").cloned().unwrap_or(Value::Null),
    }
}

/// Pull `exception_message` out of the `execution_error` status message.
///
/// Status messages are `[event_name, data]` pairs.
fn execution_error_message(status: Option<&Value>) -> Option<String> {
    status?
        .get("messages")?
        .as_array()?
        .iter()
        .filter_map(Value::as_array)
        .find(|pair| pair.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|pair| pair.get(1))
        .and_then(|data| data.get("exception_message"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
}

/// Choices offered for `input` of `node` in an `/object_info/{node}`
/// response.
///
/// Combo inputs look like `"ckpt_name": [["a.safetensors", "b.ckpt"], {...}]`.
pub fn input_choices(object_info: &Value, node: &str, input: &str) -> Vec<String> {
    let inputs = &object_info[node]["input"];
    let spec = inputs["required"]
        .get(input)
        .or_else(|| inputs["optional"].get(input));

    spec.and_then(|s| s.get(0))
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Models and samplers a backend can run, as reported by `/object_info`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Capabilities {
    pub models: Vec<String>,
    pub loras: Vec<String>,
    pub samplers: Vec<String>,
    pub schedulers: Vec<String>,
}
