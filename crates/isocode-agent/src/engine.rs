//! The ReAct engine: per-session step loop, approval gating, and the
//! session-manager operations the server boundary calls.
//!
//! The loop never raises: every failure path converges on a `final` event
//! (terminating the run) or an `observation` event (continuing).

use crate::checkpoint;
use crate::context::ContextManager;
use crate::parser::{self, Interpretation};
use crate::prompt::{self, PromptContext};
use crate::session::{Session, SessionRegistry, SessionState};
use crate::store;
use isocode_core::diff::{create_unified_diff, try_apply_patch};
use isocode_core::{
    AgentEvent, ContextAttachment, Decision, Directive, Error, Message, Mode, PendingDiff,
    Result, RuntimeConfig, SessionKey,
};
use isocode_llm::{CallOptions, ChatMessage, LlmError, LlmProvider, LlmReply};
use isocode_tools::{FileIndexCache, ToolCtx, ToolRegistry};
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Events flow through a bounded channel; a slow client blocks the loop,
/// which is the back-pressure story.
pub type EventSink = mpsc::Sender<AgentEvent>;

const NO_PROGRESS_LIMIT: u32 = 10;
const CHECKPOINT_EVERY: u64 = 8;
const COMPACTION_LIMIT: u32 = 3;
const COMPACTION_THRESHOLD: f32 = 0.75;
/// Final is nudged back at most this many times while the plan is open.
const MAX_FINAL_NUDGES: u32 = 2;
const RELEVANCE_CONTEXT_CAP: usize = 3_000;
pub(crate) const SUBTASK_STEP_CAP: u64 = 15;

/// One agent turn arriving from the server boundary.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    pub mode: Mode,
    pub model: Option<String>,
    pub workspace_root: PathBuf,
    pub context: Vec<ContextAttachment>,
    /// Hard upper bound on steps for this run.
    pub max_steps: u64,
    /// Set on delegated subtask sessions so they cannot re-delegate.
    pub disable_delegation: bool,
}

/// How a run ended. The gateway only consumes events; the delegation pool
/// needs the outcome directly.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RunOutcome {
    /// Terminal `final` was emitted and the session removed.
    Completed(String),
    /// Provider-level failure; the session was removed.
    Failed(String),
    /// A diff_request is pending; the session waits for a decision.
    AwaitingApproval,
}

enum StepFlow {
    Continue,
    EndRun(RunOutcome),
}

pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionRegistry>,
    index_cache: Arc<FileIndexCache>,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        index_cache: Arc<FileIndexCache>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            provider,
            tools,
            sessions: Arc::new(SessionRegistry::new()),
            index_cache,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn config(&self) -> &Arc<RwLock<RuntimeConfig>> {
        &self.config
    }

    // -----------------------------------------------------------------
    // Session-manager operations
    // -----------------------------------------------------------------

    /// Run one agent turn: open or resume the session, seed messages, and
    /// drive the step loop until final, pending approval, or stop.
    pub async fn run_turn(&self, request: TurnRequest, events: EventSink) {
        let _ = self.run_turn_inner(request, events).await;
    }

    /// As `run_turn`, but reporting the outcome (the delegation pool needs
    /// it). `None` means the turn was refused before the loop started.
    pub(crate) async fn run_turn_inner(
        &self,
        request: TurnRequest,
        events: EventSink,
    ) -> Option<RunOutcome> {
        let key = SessionKey::new(request.session_id.clone());
        let (session, created) = self.sessions.open_or_get(
            &key,
            request.mode,
            request.workspace_root.clone(),
            request.model.clone(),
        );

        {
            let mut state = session.state.lock().await;
            if state.pending_diff.is_some() {
                let _ = events
                    .send(AgentEvent::error(
                        "Session is waiting for a diff decision; send approve or reject.",
                    ))
                    .await;
                return None;
            }
            if created {
                self.seed_session(&mut state, &request).await;
                state.delegation_disabled = request.disable_delegation;
                let _ = checkpoint::write_checkpoint(&state.workspace_root, key.as_str(), &state);
            } else {
                if let Some(model) = request.model {
                    state.model = Some(model);
                }
                state.messages.push(Message::user(request.message.clone()));
            }
        }

        Some(self.step_loop(&session, &events, request.max_steps).await)
    }

    /// Re-enter a session waiting on a diff decision.
    ///
    /// Approve applies the diff that was stored at `diff_request` time (the
    /// client's copy is informational only); reject does no file I/O. Both
    /// push an observation and resume the loop.
    pub async fn resume_with_decision(
        &self,
        session_id: &str,
        decision: Decision,
        events: EventSink,
        max_steps: u64,
    ) -> Result<()> {
        let key = SessionKey::new(session_id);
        let session = self
            .sessions
            .get(&key)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        {
            let mut state = session.state.lock().await;
            let Some(pending) = state.pending_diff.take() else {
                return Err(Error::user("no pending diff"));
            };

            let observation = match decision {
                Decision::Approve => {
                    let ctx =
                        ToolCtx::new(state.workspace_root.clone(), session_id.to_string()).auto();
                    let perms = self.config.read().await.permissions;
                    let result = self
                        .tools
                        .run(
                            "apply_diff",
                            json!({ "path": pending.file_path, "diff": pending.diff }),
                            &ctx,
                            &perms,
                        )
                        .await;
                    format!("User APPROVED. {}", result.into_observation())
                }
                Decision::Reject => format!(
                    "User REJECTED the proposed change to {}. Propose an alternative or continue differently.",
                    pending.file_path
                ),
            };
            state.messages.push(Message::user(observation.clone()));
            let _ = events.send(AgentEvent::observation(observation)).await;
        }

        self.step_loop(&session, &events, max_steps).await;
        Ok(())
    }

    /// Request cooperative termination; the loop observes the flag at the
    /// next step boundary.
    pub fn stop(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .get(&SessionKey::new(session_id))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.request_stop();
        Ok(())
    }

    pub fn clear(&self, session_id: &str) -> bool {
        self.sessions.remove(&SessionKey::new(session_id)).is_some()
    }

    /// Manual compaction. Returns (before, after) message counts.
    pub async fn compact_session(
        &self,
        session_id: &str,
        model: Option<String>,
    ) -> Result<(usize, usize)> {
        let session = self
            .sessions
            .get(&SessionKey::new(session_id))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let mut state = session.state.lock().await;
        let before = state.messages.len();

        let model = model
            .or_else(|| state.model.clone())
            .or_else(|| self.try_default_model())
            .ok_or_else(|| Error::user("no model selected"))?;

        match ContextManager::compact(self.provider.as_ref(), &model, &state.messages).await {
            Ok(messages) => {
                state.messages = messages;
                state.compactions += 1;
                let key = session.key.as_str();
                let _ = checkpoint::write_checkpoint(&state.workspace_root, key, &state);
            }
            Err(e) => debug!("manual compaction skipped: {}", e),
        }
        Ok((before, state.messages.len()))
    }

    /// Record a new model. Conversations longer than four messages are
    /// compacted and an observation notes the switch.
    pub async fn switch_model(&self, session_id: &str, model: &str) -> Result<()> {
        let session = self
            .sessions
            .get(&SessionKey::new(session_id))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let mut state = session.state.lock().await;
        let previous = state.model.replace(model.to_string());

        if state.messages.len() > 4 {
            if let Ok(messages) =
                ContextManager::compact(self.provider.as_ref(), model, &state.messages).await
            {
                state.messages = messages;
            }
            let note = json!({
                "type": "observation",
                "content": format!(
                    "Model switched from {} to {}; earlier conversation compacted.",
                    previous.as_deref().unwrap_or("(none)"),
                    model
                ),
            });
            state.messages.push(Message::assistant(note.to_string()));
        }
        state.compactions = 0;
        Ok(())
    }

    fn try_default_model(&self) -> Option<String> {
        // try_read is fine here: config writes are rare and short-lived.
        self.config.try_read().ok().and_then(|c| c.model.clone())
    }

    // -----------------------------------------------------------------
    // Session seeding
    // -----------------------------------------------------------------

    async fn seed_session(&self, state: &mut SessionState, request: &TurnRequest) {
        let root = &request.workspace_root;
        let config = self.config.read().await;

        let context = PromptContext {
            context_files_attached: !request.context.is_empty(),
            project_context: store::project_context_summary(root, 1_500),
            project_map: Some(self.index_cache.get(root).project_map()),
            rules: store::load_rules(root),
            memory_primer: checkpoint::memory_primer(root),
            checkpoint: checkpoint::load_checkpoint(root, &request.session_id),
        };

        let system = match config.system_prompt_override {
            Some(ref custom) => format!(
                "{}\n\n## Available tools\n\n{}",
                custom,
                self.tools.render_listing()
            ),
            None => prompt::render_system_prompt(request.mode, &self.tools.render_listing(), &context),
        };
        drop(config);

        let mut first = request.message.clone();
        if request.context.is_empty() {
            // No explicit attachments: gather relevance context instead.
            if let Some(relevant) =
                self.index_cache
                    .relevance_context(root, &request.message, RELEVANCE_CONTEXT_CAP)
            {
                first.push_str("\n\n");
                first.push_str(&relevant);
            }
        } else {
            for attachment in &request.context {
                first.push_str(&format!(
                    "\n\nAttached file {}:\n```\n{}\n```",
                    attachment.path,
                    isocode_core::smart_truncate(&attachment.content, 4_000)
                ));
            }
        }

        state.messages.push(Message::system(system));
        state.messages.push(Message::user(first));
    }

    // -----------------------------------------------------------------
    // The step loop
    // -----------------------------------------------------------------

    async fn step_loop(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        max_steps: u64,
    ) -> RunOutcome {
        loop {
            if session.stop_requested() {
                return self
                    .terminate(session, events, "Agent stopped by user.", false)
                    .await;
            }

            let budget = self.config.read().await.effective_budget();

            // Pre-step bookkeeping under the session lock.
            let (view, mode, model) = {
                let mut state = session.state.lock().await;

                if state.steps_without_action >= NO_PROGRESS_LIMIT {
                    drop(state);
                    return self
                        .terminate(
                            session,
                            events,
                            "Stopping: too many consecutive steps without an action.",
                            false,
                        )
                        .await;
                }
                if state.steps >= max_steps {
                    drop(state);
                    return self
                        .terminate(
                            session,
                            events,
                            &format!("Stopping: reached the {}-step cap.", max_steps),
                            false,
                        )
                        .await;
                }
                state.steps += 1;

                let model = state
                    .model
                    .clone()
                    .or_else(|| self.try_default_model());
                let Some(model) = model else {
                    drop(state);
                    return self
                        .terminate(
                            session,
                            events,
                            "No model selected. Pass a model id with the request or set one via /config.",
                            true,
                        )
                        .await;
                };

                // Auto-compaction at 75% of budget, capped per session.
                if state.compactions < COMPACTION_LIMIT {
                    let used = ContextManager::conversation_tokens(&state.messages);
                    if used as f32 > budget as f32 * COMPACTION_THRESHOLD {
                        match ContextManager::compact(
                            self.provider.as_ref(),
                            &model,
                            &state.messages,
                        )
                        .await
                        {
                            Ok(messages) => {
                                state.messages = messages;
                                state.compactions += 1;
                                let _ = checkpoint::write_checkpoint(
                                    &state.workspace_root,
                                    session.key.as_str(),
                                    &state,
                                );
                            }
                            Err(e) => {
                                debug!("auto-compaction failed ({}), freezing counter", e);
                                state.compactions = COMPACTION_LIMIT;
                            }
                        }
                    }
                }

                if state.steps % CHECKPOINT_EVERY == 0 {
                    let _ = checkpoint::write_checkpoint(
                        &state.workspace_root,
                        session.key.as_str(),
                        &state,
                    );
                }

                let view = ContextManager::trim_for_context_window(&state.messages, budget);
                (view, state.mode, model)
            };

            // The LLM call happens without the session lock held.
            let reply = match self.call_llm(&model, &view, mode, events).await {
                Ok((reply, retries)) => {
                    if retries > 0 {
                        session.state.lock().await.retries += retries;
                    }
                    reply
                }
                Err(final_text) => {
                    return self.terminate(session, events, &final_text, true).await;
                }
            };

            match parser::interpret(&reply.content, &reply.tool_calls) {
                Interpretation::Unparsed(raw) => {
                    let mut state = session.state.lock().await;
                    state.messages.push(Message::assistant(raw));
                    let nudge = store::json_format_nudge(state.mode);
                    state.messages.push(nudge);
                    state.steps_without_action += 1;
                    debug!("unparsable reply, injected JSON nudge");
                }
                Interpretation::Directives(directives) => {
                    for directive in directives {
                        match self.dispatch(session, events, directive).await {
                            StepFlow::Continue => {}
                            StepFlow::EndRun(outcome) => return outcome,
                        }
                        if session.stop_requested() {
                            return self
                                .terminate(session, events, "Agent stopped by user.", false)
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Invoke the provider with JSON mode and the mode-specific settings.
    /// Two engine-level retries, announced as thoughts; "not found" errors
    /// terminate immediately with a pull hint. Returns the reply together
    /// with the number of retries it took.
    async fn call_llm(
        &self,
        model: &str,
        view: &[Message],
        mode: Mode,
        events: &EventSink,
    ) -> std::result::Result<(LlmReply, u32), String> {
        let options = CallOptions {
            temperature: Some(if mode.is_agent_plus() { 0.5 } else { 0.2 }),
            max_tokens: Some(4_096),
            timeout: std::time::Duration::from_secs(if mode.is_agent_plus() { 300 } else { 180 }),
            expect_json: true,
            tools: None,
            tool_choice: None,
        };
        let messages: Vec<ChatMessage> = view.iter().map(ChatMessage::from).collect();

        let mut last_error = String::new();
        for attempt in 0..3u32 {
            match self.provider.call(model, &messages, &options).await {
                Ok(reply) => return Ok((reply, attempt)),
                Err(LlmError::ModelNotFound { model, hint }) => {
                    return Err(format!("Model '{}' is not available - {}.", model, hint));
                }
                Err(e) => {
                    last_error = e.to_string();
                    if LlmError::is_not_found(&last_error) {
                        return Err(format!(
                            "Model '{}' was not found on the backend. Pull it first (e.g. `ollama pull {}`).",
                            model, model
                        ));
                    }
                    if attempt < 2 {
                        warn!("provider call failed (attempt {}): {}", attempt + 1, last_error);
                        let _ = events
                            .send(AgentEvent::Thought {
                                content: format!(
                                    "Provider error, retrying ({}/2): {}",
                                    attempt + 1,
                                    last_error
                                ),
                            })
                            .await;
                    }
                }
            }
        }
        Err(format!(
            "The model backend kept failing: {}. Check that the provider is running and reachable.",
            last_error
        ))
    }

    // -----------------------------------------------------------------
    // Directive dispatch
    // -----------------------------------------------------------------

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        directive: Directive,
    ) -> StepFlow {
        match directive {
            Directive::Thought { content } => {
                self.handle_thought(session, events, content).await;
                StepFlow::Continue
            }
            Directive::Action { tool, args } => self.handle_action(session, events, tool, args).await,
            Directive::DiffRequest { file_path, diff } => {
                self.handle_diff_request(session, events, file_path, diff)
                    .await
            }
            Directive::Delegate { tasks } => self.handle_delegate(session, events, tasks).await,
            Directive::Final { content } => self.handle_final(session, events, content).await,
        }
    }

    async fn handle_thought(&self, session: &Arc<Session>, events: &EventSink, content: String) {
        let mut state = session.state.lock().await;
        let directive = Directive::Thought {
            content: content.clone(),
        };
        state
            .messages
            .push(Message::assistant(directive_json(&directive)));

        scan_plan_markers(&mut state, &content);
        state.steps_without_action += 1;
        state.consecutive_thoughts += 1;
        state.consecutive_finals = 0;

        if state.consecutive_thoughts >= 2 {
            state.messages.push(Message::user(
                "You have been thinking for two turns without acting. Emit an action directive next.",
            ));
            state.consecutive_thoughts = 0;
        }
        drop(state);
        let _ = events.send(AgentEvent::Thought { content }).await;
    }

    async fn handle_action(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        tool: String,
        args: serde_json::Value,
    ) -> StepFlow {
        let (mode, workspace_root) = {
            let mut state = session.state.lock().await;
            let directive = Directive::Action {
                tool: tool.clone(),
                args: args.clone(),
            };
            state
                .messages
                .push(Message::assistant(directive_json(&directive)));
            (state.mode, state.workspace_root.clone())
        };

        // In plain agent mode the mutating file tools never reach the
        // dispatcher; they become approval-gated diff requests and no
        // action event is emitted for them.
        if mode == Mode::Agent && matches!(tool.as_str(), "apply_diff" | "write_file" | "replace_in_file")
        {
            return self
                .intercept_mutation(session, events, &tool, &args, &workspace_root)
                .await;
        }

        let _ = events
            .send(AgentEvent::Action {
                tool: tool.clone(),
                args: args.clone(),
            })
            .await;

        let ctx = ToolCtx::new(workspace_root, session.key.as_str().to_string()).auto();
        let perms = self.config.read().await.permissions;
        let result = self.tools.run(&tool, args.clone(), &ctx, &perms).await;
        let success = !result.is_error();

        let mut observation = result.into_observation();
        let rendered = observation.to_string();
        if rendered.contains("ENOENT") || rendered.to_lowercase().contains("no such file") {
            if let Some(map) = observation.as_object_mut() {
                map.insert(
                    "hint".to_string(),
                    json!("the path may be wrong - probe with list_files first"),
                );
            }
        }
        let observation_text = observation.to_string();

        {
            let mut state = session.state.lock().await;
            state.messages.push(Message::tool(observation_text.clone()));
            state.steps_without_action = 0;
            state.consecutive_thoughts = 0;
            state.consecutive_finals = 0;
        }
        let _ = events
            .send(AgentEvent::observation(observation_text))
            .await;

        // Reveal freshly written files in the editor (agent-plus path).
        if success && matches!(tool.as_str(), "write_file" | "replace_in_file") {
            if let Some(path) = args
                .get("path")
                .or(args.get("file_path"))
                .and_then(|v| v.as_str())
            {
                let _ = events
                    .send(AgentEvent::OpenFile {
                        path: path.to_string(),
                    })
                    .await;
            }
        }
        StepFlow::Continue
    }

    /// Agent-mode interception: synthesise a unified diff from the proposed
    /// mutation, record it as pending, and end the run awaiting approval.
    async fn intercept_mutation(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        tool: &str,
        args: &serde_json::Value,
        workspace_root: &std::path::Path,
    ) -> StepFlow {
        let Some(path) = args
            .get("path")
            .or(args.get("file_path"))
            .or(args.get("filePath"))
            .and_then(|v| v.as_str())
        else {
            return self
                .push_error_observation(session, events, format!("{}: missing path", tool))
                .await;
        };

        let resolved = match isocode_tools::confine::resolve(workspace_root, path) {
            Ok(p) => p,
            Err(e) => return self.push_error_observation(session, events, e).await,
        };
        let relative = isocode_tools::confine::relative_display(workspace_root, &resolved);
        let current = tokio::fs::read_to_string(&resolved).await.unwrap_or_default();

        let proposed = match tool {
            "write_file" => match args["content"].as_str() {
                Some(content) => content.to_string(),
                None => {
                    return self
                        .push_error_observation(session, events, "write_file: missing content")
                        .await
                }
            },
            "replace_in_file" => {
                let (Some(old), Some(new)) =
                    (args["old_string"].as_str(), args["new_string"].as_str())
                else {
                    return self
                        .push_error_observation(
                            session,
                            events,
                            "replace_in_file: missing old_string/new_string",
                        )
                        .await;
                };
                if !current.contains(old) {
                    return self
                        .push_error_observation(
                            session,
                            events,
                            "replace_in_file: old_string not found in file",
                        )
                        .await;
                }
                if args["replace_all"].as_bool().unwrap_or(false) {
                    current.replace(old, new)
                } else {
                    current.replacen(old, new, 1)
                }
            }
            "apply_diff" => {
                let Some(diff) = args["diff"].as_str() else {
                    return self
                        .push_error_observation(session, events, "apply_diff: missing diff")
                        .await;
                };
                match try_apply_patch(&current, diff) {
                    Some(patched) => patched,
                    None => {
                        return self
                            .push_error_observation(
                                session,
                                events,
                                format!("apply_diff: diff does not apply cleanly to {}", relative),
                            )
                            .await
                    }
                }
            }
            _ => unreachable!("intercept_mutation only sees mutating file tools"),
        };

        let diff = create_unified_diff(&relative, &current, &proposed);
        let pending = PendingDiff {
            file_path: relative.clone(),
            diff: diff.clone(),
        };

        {
            let mut state = session.state.lock().await;
            state.pending_diff = Some(pending);
            state.steps_without_action = 0;
            state.consecutive_thoughts = 0;
        }

        info!("session {} awaiting approval for {}", session.key, relative);
        let _ = events
            .send(AgentEvent::DiffRequest {
                file_path: relative,
                diff,
                session_id: session.key.as_str().to_string(),
            })
            .await;
        StepFlow::EndRun(RunOutcome::AwaitingApproval)
    }

    async fn handle_diff_request(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        file_path: String,
        diff: String,
    ) -> StepFlow {
        let mode = {
            let mut state = session.state.lock().await;
            let directive = Directive::DiffRequest {
                file_path: file_path.clone(),
                diff: diff.clone(),
            };
            state
                .messages
                .push(Message::assistant(directive_json(&directive)));
            state.steps_without_action = 0;
            state.consecutive_thoughts = 0;
            state.mode
        };

        if mode.is_agent_plus() {
            // Synthetic auto-approval: apply immediately and keep going.
            let workspace_root = session.state.lock().await.workspace_root.clone();
            let ctx = ToolCtx::new(workspace_root, session.key.as_str().to_string()).auto();
            let perms = self.config.read().await.permissions;
            let result = self
                .tools
                .run(
                    "apply_diff",
                    json!({ "path": file_path, "diff": diff }),
                    &ctx,
                    &perms,
                )
                .await;
            let observation = format!("Auto-approved diff for {}. {}", file_path, result.into_observation());
            session
                .state
                .lock()
                .await
                .messages
                .push(Message::user(observation.clone()));
            let _ = events.send(AgentEvent::observation(observation)).await;
            return StepFlow::Continue;
        }

        {
            let mut state = session.state.lock().await;
            state.pending_diff = Some(PendingDiff {
                file_path: file_path.clone(),
                diff: diff.clone(),
            });
        }
        info!("session {} awaiting approval for {}", session.key, file_path);
        let _ = events
            .send(AgentEvent::DiffRequest {
                file_path,
                diff,
                session_id: session.key.as_str().to_string(),
            })
            .await;
        StepFlow::EndRun(RunOutcome::AwaitingApproval)
    }

    async fn handle_delegate(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        tasks: Vec<serde_json::Value>,
    ) -> StepFlow {
        let (mode, disabled) = {
            let state = session.state.lock().await;
            (state.mode, state.delegation_disabled)
        };

        if !mode.is_agent_plus() {
            // Not available in plain agent mode: falls through to the
            // JSON-format nudge like any unknown directive.
            let mut state = session.state.lock().await;
            let raw = json!({ "type": "delegate", "tasks": tasks }).to_string();
            state.messages.push(Message::assistant(raw));
            state.messages.push(store::json_format_nudge(mode));
            state.steps_without_action += 1;
            return StepFlow::Continue;
        }

        if disabled {
            let mut state = session.state.lock().await;
            state.messages.push(Message::user(
                "Delegation is disabled for this session. Continue in single-agent mode.",
            ));
            return StepFlow::Continue;
        }

        {
            let mut state = session.state.lock().await;
            let directive = json!({ "type": "delegate", "tasks": tasks.clone() });
            state.messages.push(Message::assistant(directive.to_string()));
        }

        // `run_delegation` returns a boxed future: sub-agents re-enter the
        // step loop, and the async call cycle must be broken with type
        // erasure.
        match self.run_delegation(session, &tasks).await {
            Ok(observation) => {
                let mut state = session.state.lock().await;
                state.messages.push(Message::user(observation.clone()));
                state.steps_without_action = 0;
                state.consecutive_thoughts = 0;
                drop(state);
                let _ = events.send(AgentEvent::observation(observation)).await;
            }
            Err(e) => {
                warn!("delegation failed for {}: {}", session.key, e);
                let mut state = session.state.lock().await;
                state.delegation_disabled = true;
                state.messages.push(Message::user(format!(
                    "Delegation failed ({}). Delegation is now disabled - continue in single-agent mode.",
                    e
                )));
            }
        }
        StepFlow::Continue
    }

    async fn handle_final(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        content: String,
    ) -> StepFlow {
        {
            let mut state = session.state.lock().await;
            let open_plan = state.total_tasks > 0 && state.completed_tasks < state.total_tasks;
            if open_plan && state.consecutive_finals < MAX_FINAL_NUDGES {
                state.consecutive_finals += 1;
                let directive = Directive::Final {
                    content: content.clone(),
                };
                state
                    .messages
                    .push(Message::assistant(directive_json(&directive)));
                let nudge = format!(
                    "Only {}/{} planned tasks are done. Continue with the next task before finishing.",
                    state.completed_tasks, state.total_tasks
                );
                state.messages.push(Message::user(nudge));
                state.steps_without_action += 1;
                return StepFlow::Continue;
            }
            let directive = Directive::Final {
                content: content.clone(),
            };
            state
                .messages
                .push(Message::assistant(directive_json(&directive)));
        }

        let outcome = self.finish(session, events, &content).await;
        StepFlow::EndRun(outcome)
    }

    async fn push_error_observation(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        message: impl Into<String>,
    ) -> StepFlow {
        let observation = json!({ "error": message.into() }).to_string();
        session
            .state
            .lock()
            .await
            .messages
            .push(Message::tool(observation.clone()));
        let _ = events.send(AgentEvent::observation(observation)).await;
        StepFlow::Continue
    }

    // -----------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------

    /// Normal completion: persist, summarise, checkpoint, remove, emit final.
    async fn finish(&self, session: &Arc<Session>, events: &EventSink, content: &str) -> RunOutcome {
        self.persist_and_remove(session, content).await;
        let _ = events.send(AgentEvent::final_text(content)).await;
        RunOutcome::Completed(content.to_string())
    }

    /// Abnormal termination (stop, no-progress, provider failure). Pushes a
    /// final directive so the persisted transcript stays well-formed.
    async fn terminate(
        &self,
        session: &Arc<Session>,
        events: &EventSink,
        text: &str,
        failed: bool,
    ) -> RunOutcome {
        {
            let mut state = session.state.lock().await;
            let directive = Directive::Final {
                content: text.to_string(),
            };
            state
                .messages
                .push(Message::assistant(directive_json(&directive)));
        }
        self.persist_and_remove(session, text).await;
        let _ = events.send(AgentEvent::final_text(text)).await;
        if failed {
            RunOutcome::Failed(text.to_string())
        } else {
            RunOutcome::Completed(text.to_string())
        }
    }

    async fn persist_and_remove(&self, session: &Arc<Session>, summary_seed: &str) {
        let max_history = self.config.read().await.max_history;
        let state = session.state.lock().await;
        let workspace = state.workspace_root.clone();
        let key = session.key.as_str();

        let _ = checkpoint::write_checkpoint(&workspace, key, &state);
        let metadata = store::ConversationMetadata {
            model: state.model.clone(),
            compacted: state.compactions > 0,
        };
        let _ = store::save_conversation(&workspace, key, &state.messages, metadata, max_history);

        // Session memory: LLM summary when a model is at hand, seed text
        // otherwise.
        let summary = match state.model.clone().or_else(|| self.try_default_model()) {
            Some(model) => {
                ContextManager::session_summary(self.provider.as_ref(), &model, &state.messages)
                    .await
                    .unwrap_or_else(|| summary_seed.to_string())
            }
            None => summary_seed.to_string(),
        };
        let _ = checkpoint::save_memory_summary(&workspace, key, &summary);
        // The summary also feeds the project-context injection of future
        // sessions in this workspace.
        let _ = store::set_project_context(&workspace, key, &summary);
        drop(state);

        self.sessions.remove(&session.key);
        info!("session {} closed", session.key);
    }
}

fn directive_json(directive: &Directive) -> String {
    serde_json::to_string(directive).unwrap_or_else(|_| String::from("{}"))
}

fn plan_regexes() -> &'static (Regex, Regex, Regex) {
    static CELL: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    CELL.get_or_init(|| {
        (
            Regex::new(r"(?m)^\s*PLAN:").unwrap_or_else(|_| unreachable!()),
            Regex::new(r"(?m)^\s*\d+[.)]\s+\S").unwrap_or_else(|_| unreachable!()),
            Regex::new(r"(?m)^\s*PROGRESS:|Completed task").unwrap_or_else(|_| unreachable!()),
        )
    })
}

/// Update the plan counters from one thought.
pub(crate) fn scan_plan_markers(state: &mut SessionState, content: &str) {
    let (plan_re, numbered_re, progress_re) = plan_regexes();

    if state.total_tasks == 0 && (plan_re.is_match(content) || numbered_re.is_match(content)) {
        let count = numbered_re.find_iter(content).count();
        if count > 0 {
            state.total_tasks = count;
            state.plan = Some(content.to_string());
            debug!("plan registered with {} tasks", count);
        }
    } else if progress_re.is_match(content) && state.completed_tasks < state.total_tasks {
        state.completed_tasks += 1;
        debug!(
            "progress: {}/{} tasks",
            state.completed_tasks, state.total_tasks
        );
    }
}
