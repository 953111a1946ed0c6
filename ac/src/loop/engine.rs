//! ExecutionLoop - drives one instruction to a terminal status
//!
//! Each iteration assembles the prompt, calls the model, classifies the
//! response, runs the requested tools and feeds their results back through the
//! LoopGuard and EntropyMonitor. Every model or tool failure is absorbed and
//! converted into a [`TerminalStatus`]; `run` never returns an error.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ExecutionLimits, ResponsePolicy};
use crate::context::ContextAssembler;
use crate::entropy::{EntropyMonitor, EntropyStatus};
use crate::events::{EventEmitter, ObservabilitySink};
use crate::llm::{
    ChatRequest, ChatResponse, ModelClient, ModelError, StreamChunk, ToolCall, ToolDefinition, Turn, batch_signature,
    normalize_tool_calls,
};
use crate::tools::{DispatchOutcome, ToolDispatcher, ToolInvocation, ToolRegistry, compress_error, detect_error};

use super::guard::{LoopGuard, Severity};
use super::outcome::{ExecutionMetrics, ExecutionReport, FailureKind, InterruptKind, TerminalStatus};
use super::report::DiagnosticReport;

/// Control tool: finish with success
pub const TASK_COMPLETE_TOOL: &str = "system_task_complete";

/// Control tool: finish with failure
pub const REPORT_FAILURE_TOOL: &str = "system_report_failure";

const EMPTY_RESPONSE_NOTE: &str =
    "System Error: You returned an empty response. You MUST output content or a tool call.";

/// Consecutive rate-limit waits before the model is considered unavailable
const MAX_RATE_LIMIT_WAITS: u32 = 20;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Longest model error message kept in a failure detail
const MAX_ERROR_CHARS: usize = 300;

static REFLECTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<reflection>(.*?)</reflection>").unwrap());

const STRATEGIC_PHRASES: [&str; 3] = [
    "i am stuck",
    "requesting strategic intervention",
    "requesting strategy update",
];

/// Result of one iteration
#[derive(Debug)]
enum Step {
    Continue,
    /// Wait and retry without counting the iteration
    RateLimited(Duration),
    Done(TerminalStatus),
}

/// Result of the model call stage
enum ModelCall {
    Response(ChatResponse),
    RateLimited(Duration),
    Unavailable(String),
    Cancelled,
}

/// Single-use loop that serves one instruction to completion
pub struct ExecutionLoop {
    exec_id: String,
    limits: ExecutionLimits,
    context: ContextAssembler,
    mission_id: Option<String>,
    emitter: EventEmitter,
    cancel: CancellationToken,
    guard: LoopGuard,
    entropy: EntropyMonitor,
    metrics: ExecutionMetrics,
    transcript: Vec<Turn>,
    invocations: Vec<ToolInvocation>,
    iteration: u32,
    rate_limit_waits: u32,
}

impl ExecutionLoop {
    pub fn new(exec_id: impl Into<String>, limits: ExecutionLimits) -> Self {
        let exec_id = exec_id.into();
        debug!(%exec_id, max_iterations = limits.max_iterations, "ExecutionLoop::new: called");
        Self {
            guard: LoopGuard::from_limits(&limits),
            context: ContextAssembler::new(&Default::default()),
            mission_id: None,
            emitter: EventEmitter::new(None, exec_id.clone()),
            cancel: CancellationToken::new(),
            entropy: EntropyMonitor::default(),
            metrics: ExecutionMetrics::new(exec_id.clone()),
            transcript: Vec::new(),
            invocations: Vec::new(),
            iteration: 0,
            rate_limit_waits: 0,
            limits,
            exec_id,
        }
    }

    /// Loop configured from every relevant config section
    pub fn from_config(exec_id: impl Into<String>, config: &Config) -> Self {
        Self::new(exec_id, config.execution.clone())
            .with_context(ContextAssembler::new(&config.context))
            .with_entropy(EntropyMonitor::from_config(&config.entropy))
    }

    pub fn with_context(mut self, context: ContextAssembler) -> Self {
        self.context = context;
        self
    }

    /// Mission the run belongs to; mixed into entropy fingerprints
    pub fn with_mission(mut self, mission_id: impl Into<String>) -> Self {
        self.mission_id = Some(mission_id.into());
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.emitter = EventEmitter::new(Some(sink), self.exec_id.clone());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_entropy(mut self, entropy: EntropyMonitor) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Run `instruction` until a terminal status
    pub async fn run(mut self, instruction: &str, registry: &dyn ToolRegistry, model: &dyn ModelClient) -> ExecutionReport {
        let soft_limit = self.limits.soft_limit();
        let hard_limit = self.limits.hard_limit();
        info!(
            "Starting execution {} (soft limit: {}, hard limit: {})",
            self.exec_id, soft_limit, hard_limit
        );
        let tools = offered_tools(registry);
        let dispatcher = ToolDispatcher::new(self.limits.tool_timeout(), self.cancel.clone());

        let status = loop {
            if self.cancel.is_cancelled() {
                break TerminalStatus::interrupted(InterruptKind::Cancelled, "Execution cancelled");
            }
            if self.iteration >= hard_limit {
                break self.exhausted(hard_limit);
            }

            self.iteration += 1;
            debug!(exec_id = %self.exec_id, iteration = self.iteration, "ExecutionLoop::run: iteration");
            self.emitter.loop_start(self.iteration);
            let started = Instant::now();

            let step = self.run_iteration(instruction, &tools, registry, model, &dispatcher).await;

            match step {
                Step::Continue => self.metrics.record_iteration(started.elapsed()),
                Step::RateLimited(retry_after) => {
                    warn!("Rate limited, sleeping for {:?}", retry_after);
                    self.iteration -= 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
                Step::Done(status) => {
                    self.metrics.record_iteration(started.elapsed());
                    break status;
                }
            }
        };

        self.finish(status)
    }

    async fn run_iteration(
        &mut self,
        instruction: &str,
        tools: &[ToolDefinition],
        registry: &dyn ToolRegistry,
        model: &dyn ModelClient,
        dispatcher: &ToolDispatcher,
    ) -> Step {
        let mut messages = self.context.build(instruction);
        if self.iteration > self.limits.soft_limit() {
            let hint = format!(
                "Diagnostic Hint: You have exceeded {} iterations (now at {}, hard limit {}). \
                 Step back, check whether your approach is working, and finish or report failure.",
                self.limits.soft_limit(),
                self.iteration,
                self.limits.hard_limit()
            );
            self.emitter.advisory("iteration_limit", &hint);
            messages.push(Turn::system(hint));
        }

        let request = ChatRequest {
            messages,
            tools: tools.to_vec(),
        };
        let response = match self.call_model(request, model).await {
            ModelCall::Response(response) => response,
            ModelCall::RateLimited(retry_after) => return Step::RateLimited(retry_after),
            ModelCall::Unavailable(detail) => {
                return Step::Done(TerminalStatus::failure(FailureKind::ModelUnavailable, detail));
            }
            ModelCall::Cancelled => {
                return Step::Done(TerminalStatus::interrupted(
                    InterruptKind::Cancelled,
                    "Execution cancelled during model call",
                ));
            }
        };

        if response.is_empty() {
            return match self.guard.check_empty_response() {
                Severity::Trip => Step::Done(TerminalStatus::failure(
                    FailureKind::ContextPoisoned,
                    "Model returned two consecutive empty responses",
                )),
                _ => {
                    self.emitter.advisory("loop_guard", EMPTY_RESPONSE_NOTE);
                    self.append(Turn::system(EMPTY_RESPONSE_NOTE));
                    Step::Continue
                }
            };
        }
        self.guard.record_response();

        let reasoning = response.reasoning.as_deref().map(str::trim).filter(|r| !r.is_empty());
        let content = match (response.trimmed_content(), reasoning) {
            (Some(content), _) => content.to_string(),
            (None, Some(reasoning)) => {
                debug!("run_iteration: using reasoning as content");
                reasoning.to_string()
            }
            (None, None) => String::new(),
        };

        if let Some(reflection) = strategic_request(&content) {
            self.append(Turn::assistant(content.clone(), vec![]));
            return Step::Done(TerminalStatus::interrupted(InterruptKind::StrategicRequest, reflection));
        }

        let calls = normalize_tool_calls(&response.tool_calls, self.iteration);
        if calls.is_empty() {
            self.append(Turn::assistant(content.clone(), vec![]));
            return Step::Done(match self.limits.response_policy {
                ResponsePolicy::RequireToolCall => TerminalStatus::failure(
                    FailureKind::Hallucination,
                    format!("Model answered without calling a tool. Raw content:\n{}", content),
                ),
                ResponsePolicy::FreeForm => TerminalStatus::Success { answer: content },
            });
        }

        let signature = batch_signature(&calls);
        let (regular, control) = split_control(&calls);
        let answered = regular.len() + usize::from(control.is_some());
        self.append(Turn::assistant(content.clone(), calls[..answered].to_vec()));

        let mut notes = Vec::new();
        match self.guard.check_repeated_call(&signature) {
            Severity::Trip => {
                self.skip_calls(&calls[..answered], "identical call batch repeated, loop detected");
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                return Step::Done(TerminalStatus::interrupted(
                    InterruptKind::LoopDetected,
                    format!(
                        "Identical tool call batch [{}] repeated {} times",
                        names.join(", "),
                        self.guard.state().repeat_count
                    ),
                ));
            }
            Severity::Advisory => {
                let note = "Warning: You are repeating the exact same tool calls. The result will not change; try a different approach.";
                self.emitter.advisory("loop_guard", note);
                notes.push(note.to_string());
            }
            Severity::Clear => {}
        }

        let terminal = self.execute_batch(regular, registry, dispatcher, &mut notes).await;

        if let (Some(_), Some(call)) = (&terminal, control) {
            self.skip_calls(std::slice::from_ref(call), "run stopped by an earlier tool result");
        }
        for note in notes {
            self.append(Turn::system(note));
        }
        if let Some(status) = terminal {
            return Step::Done(status);
        }

        match control {
            Some(call) => Step::Done(self.handle_control(call, &content)),
            None => Step::Continue,
        }
    }

    /// Call the model, retrying retryable errors with doubling backoff
    async fn call_model(&mut self, request: ChatRequest, model: &dyn ModelClient) -> ModelCall {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ModelCall::Cancelled,
                result = self.chat_once(request.clone(), model) => result,
            };
            let error = match result {
                Ok(response) => {
                    self.rate_limit_waits = 0;
                    self.metrics.record_api_call(&response.usage);
                    return ModelCall::Response(response);
                }
                Err(e) => e,
            };

            if error.is_rate_limit() {
                self.rate_limit_waits += 1;
                if self.rate_limit_waits > MAX_RATE_LIMIT_WAITS {
                    return ModelCall::Unavailable(sanitize_model_error(&error));
                }
                return ModelCall::RateLimited(error.retry_after().unwrap_or(Duration::from_secs(60)));
            }
            if error.is_retryable() && attempt < self.limits.model_retries {
                attempt += 1;
                warn!(attempt, error = %error, "Recoverable model error, retrying in {:?}", backoff);
                tokio::select! {
                    _ = self.cancel.cancelled() => return ModelCall::Cancelled,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff *= 2;
                continue;
            }
            warn!(error = %error, "Model unavailable");
            return ModelCall::Unavailable(sanitize_model_error(&error));
        }
    }

    /// One model call; streams reasoning deltas to the sink when one is attached
    async fn chat_once(&self, request: ChatRequest, model: &dyn ModelClient) -> Result<ChatResponse, ModelError> {
        if !self.emitter.is_attached() {
            return model.chat(request).await;
        }
        let (tx, mut rx) = mpsc::channel(64);
        let emitter = self.emitter.clone();
        let forward = async move {
            while let Some(chunk) = rx.recv().await {
                if let StreamChunk::ReasoningDelta(text) = chunk {
                    emitter.reasoning(&text);
                }
            }
        };
        let (result, _) = tokio::join!(model.chat_stream(request, tx), forward);
        result
    }

    /// Execute the regular calls of a batch and classify their results
    ///
    /// Tool turns are appended in call order before any classification, so the
    /// transcript stays well formed whatever the verdict.
    async fn execute_batch(
        &mut self,
        calls: &[ToolCall],
        registry: &dyn ToolRegistry,
        dispatcher: &ToolDispatcher,
        notes: &mut Vec<String>,
    ) -> Option<TerminalStatus> {
        if calls.is_empty() {
            return None;
        }
        for call in calls {
            self.emitter.tool(&call.id, &call.name, &call.args());
        }
        let outcomes = dispatcher.dispatch_batch(registry, calls, self.limits.parallel_tools).await;

        let mut verdicts = Vec::with_capacity(calls.len());
        for (call, (outcome, duration)) in calls.iter().zip(outcomes) {
            let text = outcome.text().to_string();
            let is_error = !matches!(outcome, DispatchOutcome::Completed(_))
                || detect_error(&call.name, &text, &self.limits.shell_tools);
            let invocation = ToolInvocation::record(call, &outcome, duration, is_error);
            self.emitter.tool_result(&call.id, &call.name, is_error, invocation.duration_ms);
            self.metrics.record_tool_call(&call.name);
            self.invocations.push(invocation);
            self.append(Turn::tool(call.id.clone(), text.clone()));
            verdicts.push((call, text, is_error));
        }

        let fingerprint = verdicts.iter().map(|(_, text, _)| text.as_str()).collect::<Vec<_>>().join("\n");
        let tag = calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(",");
        self.entropy.capture(&fingerprint, &tag, self.mission_id.as_deref());
        let analysis = self.entropy.analyze();
        if analysis.status == EntropyStatus::Stagnant {
            debug!(report = %analysis.report(), "execute_batch: stagnation advisory");
            self.emitter.advisory("entropy", &analysis.report());
        }

        for (call, text, is_error) in verdicts {
            if let Some(keyword) = self.guard.check_critical_keyword(&text) {
                let detail = format!(
                    "Tool '{}' hit an unrecoverable condition ('{}'):\n{}",
                    call.name,
                    keyword,
                    compress_error(&text, &call.name).format_report()
                );
                return Some(TerminalStatus::failure(FailureKind::CriticalToolFailure, detail));
            }
            if !is_error {
                self.guard.record_tool_success(&call.name);
                continue;
            }

            let compressed = compress_error(&text, &call.name);
            let report = compressed.format_report();
            match self.guard.check_tool_error(&call.name, &compressed.fingerprint(), &report) {
                Severity::Trip => {
                    return Some(TerminalStatus::interrupted(InterruptKind::ReplanNeeded, report));
                }
                Severity::Advisory => {
                    let note = format!(
                        "Warning: Tool '{}' failed again with the same error. Change your approach instead of retrying.",
                        call.name
                    );
                    self.emitter.advisory("loop_guard", &note);
                    notes.push(note);
                }
                Severity::Clear => {}
            }
        }
        None
    }

    fn handle_control(&mut self, call: &ToolCall, content: &str) -> TerminalStatus {
        let args = call.args();
        let field = |name: &str| args.get(name).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty());
        let (status, ack) = if call.name == TASK_COMPLETE_TOOL {
            let answer = field("summary").unwrap_or(content).to_string();
            (TerminalStatus::Success { answer }, "Task marked complete.")
        } else {
            let reason = field("reason").unwrap_or("Agent reported failure without a reason").to_string();
            (
                TerminalStatus::failure(FailureKind::ReportedByAgent, reason),
                "Failure reported.",
            )
        };
        self.append(Turn::tool(call.id.clone(), ack));
        status
    }

    /// Answer calls that will never run, keeping every call paired with a tool turn
    fn skip_calls(&mut self, calls: &[ToolCall], reason: &str) {
        for call in calls {
            debug!(tool = %call.name, id = %call.id, %reason, "skip_calls: not executed");
            self.append(Turn::tool(call.id.clone(), format!("Skipped: {}.", reason)));
        }
    }

    fn exhausted(&self, hard_limit: u32) -> TerminalStatus {
        warn!(exec_id = %self.exec_id, hard_limit, "Hard iteration limit reached");
        let report = DiagnosticReport::from_guard(
            format!("Hard iteration limit ({}) reached without a terminal state", hard_limit),
            self.iteration,
            self.guard.state(),
        );
        TerminalStatus::failure(FailureKind::IterationLimit, report.to_string())
    }

    fn append(&mut self, turn: Turn) {
        self.context.add_turn(turn.clone());
        self.transcript.push(turn);
    }

    fn finish(mut self, status: TerminalStatus) -> ExecutionReport {
        self.metrics.iterations = self.iteration;
        self.metrics.mark_complete(status.is_success());
        self.emitter.terminal(status.label(), status.tag(), self.iteration);
        if status.is_success() {
            info!("Execution {} completed after {} iterations", self.exec_id, self.iteration);
        } else {
            warn!("Execution {} ended: {} after {} iterations", self.exec_id, status, self.iteration);
        }
        ExecutionReport {
            status,
            transcript: self.transcript,
            invocations: self.invocations,
            metrics: self.metrics,
            entropy: self.entropy.analyze(),
        }
    }
}

/// Registry tools plus the loop's control tools
fn offered_tools(registry: &dyn ToolRegistry) -> Vec<ToolDefinition> {
    let mut tools = registry.definitions();
    tools.retain(|t| t.name != TASK_COMPLETE_TOOL && t.name != REPORT_FAILURE_TOOL);
    tools.push(ToolDefinition {
        name: TASK_COMPLETE_TOOL.to_string(),
        description: "Call when the instruction is fully done.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": { "summary": { "type": "string", "description": "What was accomplished" } },
            "required": ["summary"]
        }),
    });
    tools.push(ToolDefinition {
        name: REPORT_FAILURE_TOOL.to_string(),
        description: "Call when the instruction cannot be done.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": { "reason": { "type": "string", "description": "Why it cannot be done" } },
            "required": ["reason"]
        }),
    });
    tools
}

/// Split a batch at its first control call; calls after it are dropped
fn split_control(calls: &[ToolCall]) -> (&[ToolCall], Option<&ToolCall>) {
    match calls
        .iter()
        .position(|c| c.name == TASK_COMPLETE_TOOL || c.name == REPORT_FAILURE_TOOL)
    {
        Some(idx) => (&calls[..idx], calls.get(idx)),
        None => (calls, None),
    }
}

/// Reflection text when it asks for strategic intervention
fn strategic_request(content: &str) -> Option<String> {
    REFLECTION.captures_iter(content).find_map(|caps| {
        let text = caps.get(1)?.as_str().trim();
        let lower = text.to_lowercase();
        STRATEGIC_PHRASES
            .iter()
            .any(|p| lower.contains(p))
            .then(|| text.to_string())
    })
}

/// Single-line, length-bounded model error text
fn sanitize_model_error(error: &ModelError) -> String {
    let flat = error.to_string().split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > MAX_ERROR_CHARS {
        let cut: String = flat.chars().take(MAX_ERROR_CHARS).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}
