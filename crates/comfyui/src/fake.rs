//! In-process fake ComfyUI server for integration tests.
//!
//! Serves the subset of the REST API the orchestrator uses on an
//! ephemeral localhost port. Prompts are queued on submission and stay
//! there until a test calls [`FakeComfyUI::complete`],
//! [`FakeComfyUI::fail`] or [`FakeComfyUI::forget`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct FakeState {
    down: AtomicBool,
    reject_submissions: AtomicBool,
    fail_history: AtomicBool,
    submit_failures: AtomicU32,
    ping_delay_ms: AtomicU64,
    phantom_depth: AtomicU32,
    submissions: AtomicU32,
    interrupts: AtomicU32,
    queue: Mutex<VecDeque<String>>,
    history: Mutex<HashMap<String, Value>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeState {
    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

/// A running fake backend. The server task stops when this is dropped.
pub struct FakeComfyUI {
    base_url: String,
    state: Arc<FakeState>,
    handle: JoinHandle<()>,
}

impl FakeComfyUI {
    /// Bind `127.0.0.1:0` and start serving.
    pub async fn spawn() -> std::io::Result<Self> {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/system_stats", get(system_stats))
            .route("/prompt", post(submit))
            .route("/queue", get(queue).post(delete_from_queue))
            .route("/interrupt", post(interrupt))
            .route("/history/{prompt_id}", get(history))
            .route("/object_info/{node}", get(object_info))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            state,
            handle,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Answer every request with 503 while `down`.
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    /// Reject submissions with 400, like an invalid workflow.
    pub fn reject_submissions(&self, reject: bool) {
        self.state.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Answer `/history` with 503 while set.
    pub fn fail_history(&self, fail: bool) {
        self.state.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` submissions with 503.
    pub fn fail_next_submissions(&self, n: u32) {
        self.state.submit_failures.store(n, Ordering::SeqCst);
    }

    /// Delay `/system_stats` responses.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.state
            .ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Report `n` extra queued prompts that belong to nobody.
    pub fn set_phantom_depth(&self, n: u32) {
        self.state.phantom_depth.store(n, Ordering::SeqCst);
    }

    /// Accepted submissions so far.
    pub fn submissions(&self) -> u32 {
        self.state.submissions.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> u32 {
        self.state.interrupts.load(Ordering::SeqCst)
    }

    /// Prompt ids currently queued, running one first.
    pub async fn queued(&self) -> Vec<String> {
        self.state.queue.lock().await.iter().cloned().collect()
    }

    /// Prompt ids removed through `POST /queue`.
    pub async fn deleted(&self) -> Vec<String> {
        self.state.deleted.lock().await.clone()
    }

    /// Finish a prompt successfully with the given outputs.
    pub async fn complete(&self, prompt_id: &str, outputs: Value) {
        self.finish(
            prompt_id,
            json!({
                "prompt": [],
                "outputs": outputs,
                "status": { "status_str": "success", "completed": true, "messages": [] },
            }),
        )
        .await;
    }

    /// Finish a prompt with an execution error.
    pub async fn fail(&self, prompt_id: &str, message: &str) {
        self.finish(
            prompt_id,
            json!({
                "prompt": [],
                "outputs": {},
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [["execution_error", { "exception_message": message }]],
                },
            }),
        )
        .await;
    }

    /// Drop a prompt from the queue without leaving any history.
    pub async fn forget(&self, prompt_id: &str) {
        self.state.queue.lock().await.retain(|id| id != prompt_id);
    }

    async fn finish(&self, prompt_id: &str, entry: Value) {
        self.forget(prompt_id).await;
        self.state
            .history
            .lock()
            .await
            .insert(prompt_id.to_string(), entry);
    }
}

impl Drop for FakeComfyUI {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type Shared = State<Arc<FakeState>>;

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "backend down").into_response()
}

async fn system_stats(State(state): Shared) -> Response {
    if state.is_down() {
        return unavailable();
    }
    let delay = state.ping_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Json(json!({ "system": { "os": "fake", "comfyui_version": "0.0.0" }, "devices": [] }))
        .into_response()
}

async fn submit(State(state): Shared, Json(_body): Json<Value>) -> Response {
    if state.is_down() {
        return unavailable();
    }
    if state.reject_submissions.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "type": "prompt_outputs_failed_validation" } })),
        )
            .into_response();
    }
    let failing = state
        .submit_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return unavailable();
    }

    let prompt_id = uuid::Uuid::new_v4().to_string();
    let number = {
        let mut queue = state.queue.lock().await;
        queue.push_back(prompt_id.clone());
        queue.len()
    };
    state.submissions.fetch_add(1, Ordering::SeqCst);

    Json(json!({ "prompt_id": prompt_id, "number": number, "node_errors": {} })).into_response()
}

async fn queue(State(state): Shared) -> Response {
    if state.is_down() {
        return unavailable();
    }
    let entry = |n: usize, id: &str| json!([n, id, {}, {}, []]);

    let queue = state.queue.lock().await;
    let running: Vec<Value> = queue.iter().take(1).map(|id| entry(0, id)).collect();
    let mut pending: Vec<Value> = queue
        .iter()
        .enumerate()
        .skip(1)
        .map(|(n, id)| entry(n, id))
        .collect();
    let phantom = state.phantom_depth.load(Ordering::SeqCst) as usize;
    pending.extend((0..phantom).map(|n| entry(queue.len() + n, &format!("phantom-{n}"))));

    Json(json!({ "queue_running": running, "queue_pending": pending })).into_response()
}

async fn delete_from_queue(State(state): Shared, Json(body): Json<Value>) -> Response {
    if state.is_down() {
        return unavailable();
    }
    let ids: Vec<String> = body["delete"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    state.queue.lock().await.retain(|id| !ids.contains(id));
    state.deleted.lock().await.extend(ids);
    StatusCode::OK.into_response()
}

async fn interrupt(State(state): Shared) -> Response {
    if state.is_down() {
        return unavailable();
    }
    state.interrupts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK.into_response()
}

async fn history(State(state): Shared, Path(prompt_id): Path<String>) -> Response {
    if state.is_down() || state.fail_history.load(Ordering::SeqCst) {
        return unavailable();
    }
    let history = state.history.lock().await;
    let body = match history.get(&prompt_id) {
        Some(entry) => json!({ prompt_id: entry }),
        None => json!({}),
    };
    Json(body).into_response()
}

async fn object_info(State(state): Shared, Path(node): Path<String>) -> Response {
    if state.is_down() {
        return unavailable();
    }
    let input = match node.as_str() {
        "CheckpointLoaderSimple" => json!({
            "required": { "ckpt_name": [["sd_xl_base_1.0.safetensors", "v1-5-pruned.ckpt"]] }
        }),
        "LoraLoader" => json!({
            "required": {
                "model": ["MODEL"],
                "lora_name": [["detail_tweaker.safetensors"]],
                "strength_model": ["FLOAT", { "default": 1.0 }]
            }
        }),
        "KSampler" => json!({
            "required": {
                "sampler_name": [["euler", "euler_ancestral", "dpmpp_2m"]],
                "scheduler": [["normal", "karras"]],
                "steps": ["INT", { "default": 20 }]
            }
        }),
        _ => return Json(json!({})).into_response(),
    };
    Json(json!({ node: { "input": input } })).into_response()
}
