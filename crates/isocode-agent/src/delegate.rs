//! The delegation pool: bounded-concurrency sub-agents with per-subtask
//! model selection and model-fallback on failure.
//!
//! Each subtask gets an ordered list of models to try. An explicit hint wins
//! outright; otherwise the task is classified (vision / coder / general) and
//! available models are scored against the class's patterns. Workers run in
//! chunks of `max_workers`; non-fatal failures advance to the next model,
//! fatal ones disable delegation for the session.

use crate::engine::{AgentRuntime, RunOutcome, TurnRequest, SUBTASK_STEP_CAP};
use crate::session::Session;
use futures::future::BoxFuture;
use isocode_core::{AgentEvent, DelegateTask, Mode, SessionKey};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const VISION_TASK_PATTERNS: &[&str] = &[
    "screenshot",
    "browser",
    "image",
    "what is on the screen",
    "picture",
    "png",
    "jpg",
];
const CODER_TASK_PATTERNS: &[&str] = &[
    "implement",
    "fix",
    "refactor",
    "edit",
    "write",
    "file",
    "apply_diff",
    "code",
    "bug",
    "test",
];

const VISION_MODEL_PATTERNS: &[&str] =
    &["llava", "vision", "bakllava", "moondream", "minicpm", "vl"];
const CODER_MODEL_PATTERNS: &[&str] =
    &["coder", "codellama", "starcoder", "deepseek", "devstral", "codestral"];
const GENERAL_MODEL_PATTERNS: &[&str] =
    &["llama", "mistral", "gemma", "phi", "qwen", "instruct"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskClass {
    Vision,
    Coder,
    General,
}

pub(crate) fn classify_task(task: &str) -> TaskClass {
    let lower = task.to_lowercase();
    if VISION_TASK_PATTERNS.iter().any(|p| lower.contains(p)) {
        TaskClass::Vision
    } else if CODER_TASK_PATTERNS.iter().any(|p| lower.contains(p)) {
        TaskClass::Coder
    } else {
        TaskClass::General
    }
}

fn class_patterns(class: TaskClass) -> &'static [&'static str] {
    match class {
        TaskClass::Vision => VISION_MODEL_PATTERNS,
        TaskClass::Coder => CODER_MODEL_PATTERNS,
        TaskClass::General => GENERAL_MODEL_PATTERNS,
    }
}

fn score_model(id: &str, class: TaskClass) -> u32 {
    let lower = id.to_lowercase();
    class_patterns(class)
        .iter()
        .filter(|p| lower.contains(*p))
        .count() as u32
}

fn is_coder_model(id: &str) -> bool {
    score_model(id, TaskClass::Coder) > 0
}

/// Ordered model list for one subtask.
pub(crate) fn build_model_chain(
    task: &DelegateTask,
    available: &[String],
    session_default: Option<&str>,
    configured_vision: Option<&str>,
) -> Vec<String> {
    // An explicit hint is used exactly as given.
    if let Some(ref explicit) = task.model {
        return vec![explicit.clone()];
    }

    let class = classify_task(&task.task);
    let mut chain: Vec<String> = Vec::new();

    let primary = available
        .iter()
        .map(|id| (id, score_model(id, class)))
        .filter(|(_, score)| *score > 0)
        .max_by_key(|(_, score)| *score)
        .map(|(id, _)| id.clone());

    match primary {
        Some(model) => chain.push(model),
        None if class == TaskClass::Vision => {
            // No vision-looking model. If the session default is itself a
            // coder model, prefer any non-coder model before the configured
            // vision model.
            if session_default.map(is_coder_model).unwrap_or(false) {
                if let Some(non_coder) = available.iter().find(|id| !is_coder_model(id)) {
                    chain.push(non_coder.clone());
                }
            }
            if let Some(vision) = configured_vision {
                push_unique(&mut chain, vision);
            }
        }
        None => {}
    }

    for model in available {
        push_unique(&mut chain, model);
    }
    if let Some(vision) = configured_vision {
        push_unique(&mut chain, vision);
    }
    if let Some(default) = session_default {
        push_unique(&mut chain, default);
    }
    chain
}

fn push_unique(chain: &mut Vec<String>, model: &str) {
    if !chain.iter().any(|m| m == model) {
        chain.push(model.to_string());
    }
}

/// Failure patterns that disable delegation instead of trying more models.
pub(crate) fn is_fatal_worker_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["memory", "heap", "enomem", "out of memory", "econnreset", "socket hang up", "abort"]
        .iter()
        .any(|p| lower.contains(p))
}

impl AgentRuntime {
    /// Execute a `delegate` directive. Returns the aggregated observation
    /// text, or an error that disables delegation for the session.
    ///
    /// Declared as a boxed future (rather than `async fn`) because sub-agents
    /// re-enter the step loop and can call back into this function; the
    /// explicit `Send` bound here breaks that recursive-inference cycle.
    pub(crate) fn run_delegation<'a>(
        &'a self,
        session: &'a Arc<Session>,
        raw_tasks: &'a [serde_json::Value],
    ) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
        let tasks: Vec<DelegateTask> = raw_tasks.iter().filter_map(DelegateTask::normalise).collect();
        if tasks.is_empty() {
            return Err("delegate directive carried no usable tasks".to_string());
        }

        // One model listing per delegation.
        let available: Vec<String> = self
            .provider()
            .list_models()
            .await
            .map(|models| models.into_iter().map(|m| m.id).collect())
            .unwrap_or_default();

        let (session_default, workspace_root) = {
            let state = session.state.lock().await;
            (state.model.clone(), state.workspace_root.clone())
        };
        let (configured_vision, max_workers) = {
            let config = self.config().read().await;
            (config.vision_model.clone(), config.max_workers.clamp(1, 5))
        };

        let chains: Vec<Vec<String>> = tasks
            .iter()
            .map(|task| {
                build_model_chain(
                    task,
                    &available,
                    session_default.as_deref(),
                    configured_vision.as_deref(),
                )
            })
            .collect();

        info!(
            "delegating {} tasks from {} ({} workers)",
            tasks.len(),
            session.key,
            max_workers
        );

        let mut results: Vec<Option<Result<String, String>>> = vec![None; tasks.len()];
        let indices: Vec<usize> = (0..tasks.len()).collect();
        for chunk in indices.chunks(max_workers) {
            let workers = chunk.iter().map(|&i| {
                let task = tasks[i].clone();
                let chain = chains[i].clone();
                let root = workspace_root.clone();
                let parent = session.key.clone();
                async move { (i, self.run_worker(&parent, i, &task, &chain, root).await) }
            });
            for (i, outcome) in futures::future::join_all(workers).await {
                results[i] = Some(outcome);
            }
        }

        let mut fatal: Option<String> = None;
        let mut failures = 0usize;
        let mut parts: Vec<String> = Vec::with_capacity(tasks.len());
        for (i, outcome) in results.into_iter().enumerate() {
            match outcome {
                Some(Ok(text)) => parts.push(format!("[Subtask {}] {}", i + 1, text)),
                Some(Err(e)) => {
                    failures += 1;
                    if is_fatal_worker_error(&e) && fatal.is_none() {
                        fatal = Some(e.clone());
                    }
                    parts.push(format!("[Subtask {}] failed: {}", i + 1, e));
                }
                None => unreachable!("every task index is filled"),
            }
        }

        if let Some(fatal) = fatal {
            return Err(format!("fatal worker error: {}", fatal));
        }
        if failures == tasks.len() {
            return Err("every delegated task failed".to_string());
        }

        Ok(json!({
            "swarm": true,
            "results": tasks.len(),
            "content": parts.join("\n\n"),
        })
        .to_string())
        })
    }

    /// Run one subtask through its model chain.
    async fn run_worker(
        &self,
        parent: &SessionKey,
        index: usize,
        task: &DelegateTask,
        chain: &[String],
        workspace_root: std::path::PathBuf,
    ) -> Result<String, String> {
        if chain.is_empty() {
            return Err("no models available".to_string());
        }
        let mut last_error = String::new();
        for model in chain {
            match self
                .run_subtask(parent, index, &task.task, model, workspace_root.clone())
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) => {
                    if is_fatal_worker_error(&e) {
                        return Err(e);
                    }
                    warn!(
                        "subtask {} failed on {} ({}), trying next model",
                        index + 1,
                        model,
                        e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// One sub-agent: a fresh agent-plus session with a derived id, a
    /// 15-step cap, delegation disabled, and a sink that keeps only the
    /// final text.
    async fn run_subtask(
        &self,
        parent: &SessionKey,
        index: usize,
        task: &str,
        model: &str,
        workspace_root: std::path::PathBuf,
    ) -> Result<String, String> {
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let child_id = format!("{}-sub{}-{}", parent, index + 1, suffix);
        debug!("subtask {} -> session {} on {}", index + 1, child_id, model);

        let request = TurnRequest {
            session_id: child_id.clone(),
            message: task.to_string(),
            mode: Mode::AgentPlus,
            model: Some(model.to_string()),
            workspace_root,
            context: Vec::new(),
            max_steps: SUBTASK_STEP_CAP,
            disable_delegation: true,
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel::<AgentEvent>(256);
        let outcome = self.run_turn_inner(request, tx).await;

        // Drain the sink; only the final text matters to the outer session.
        let mut final_text = String::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::Final { content } = event {
                final_text = content;
            }
        }

        match outcome {
            Some(RunOutcome::Completed(text)) => {
                Ok(if final_text.is_empty() { text } else { final_text })
            }
            Some(RunOutcome::Failed(error)) => Err(error),
            Some(RunOutcome::AwaitingApproval) => {
                // Sub-agents run agent-plus and never wait; treat as a bug.
                let _ = self.clear(&child_id);
                Err("subtask unexpectedly paused for approval".to_string())
            }
            None => Err("subtask session was already active".to_string()),
        }
    }
}
