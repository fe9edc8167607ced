//! Execution engine: drives one run through the model/tool loop.
//!
//! Every side effect (status, steps, token usage, warnings) is written to the
//! [`RunStore`] as it happens, keyed by the run identity carried in the
//! [`RunInvocation`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::hierarchy::{DelegationChain, DelegationLauncher, HierarchyResolver};
use crate::catalog::AgentDefinition;
use crate::error::{OrchestrationError, Result};
use crate::llm::{ChatMessage, LlmClient, Role, TokenUsage, ToolCall};
use crate::mcp::ConnectionPool;
use crate::run::{RunId, RunStatus, RunStore, StatusUpdate, Step, StepKind};
use crate::tools::{ToolContext, ToolRegistry};

/// Everything the engine needs to execute one run.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    run_id: RunId,
    agent: AgentDefinition,
    input: String,
    variables: HashMap<String, String>,
    chain: DelegationChain,
    cancel: CancellationToken,
}

impl RunInvocation {
    /// The run must already be saved in the store under `run_id`.
    pub fn new(run_id: RunId, agent: AgentDefinition, input: impl Into<String>) -> Self {
        let chain = DelegationChain::root(&agent.id);
        Self {
            run_id,
            agent,
            input: input.into(),
            variables: HashMap::new(),
            chain,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// Position in a delegation chain, for nested runs.
    pub fn with_chain(mut self, chain: DelegationChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn agent(&self) -> &AgentDefinition {
        &self.agent
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Summary of a completed run. The full record lives in the store.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub final_output: Option<String>,
    pub structured_output: Option<Value>,
    pub truncated: bool,
    pub steps: Vec<Step>,
    pub usage: TokenUsage,
}

/// How the loop ended without an error.
struct Finish {
    output: Option<String>,
    truncated: bool,
}

/// Steps and usage accumulated by one run.
#[derive(Default)]
struct Trace {
    steps: Vec<Step>,
    usage: TokenUsage,
    last_text: Option<String>,
}

fn persistence(e: String) -> OrchestrationError {
    OrchestrationError::Persistence(e)
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(OrchestrationError::Cancelled);
    }
    Ok(())
}

/// Runs agents against the model, the tool pool and delegated children.
pub struct ExecutionEngine {
    llm: Arc<dyn LlmClient>,
    pool: ConnectionPool,
    resolver: Arc<HierarchyResolver>,
    store: Arc<dyn RunStore>,
    default_model: String,
    default_max_steps: usize,
}

impl ExecutionEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        pool: ConnectionPool,
        resolver: Arc<HierarchyResolver>,
        store: Arc<dyn RunStore>,
        default_model: impl Into<String>,
        default_max_steps: usize,
    ) -> Self {
        Self {
            llm,
            pool,
            resolver,
            store,
            default_model: default_model.into(),
            default_max_steps,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Execute a run to a terminal state.
    ///
    /// On error the run has already been marked `failed` or `cancelled` with
    /// the structured error, unless the identity itself was invalid.
    pub async fn run(
        &self,
        invocation: RunInvocation,
        launcher: Arc<dyn DelegationLauncher>,
    ) -> Result<RunOutcome> {
        let run_id = invocation.run_id;
        let existing = self
            .store
            .get_run(run_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| {
                OrchestrationError::InvalidRunIdentity(format!("run {} was never enqueued", run_id))
            })?;
        if existing.status.is_terminal() {
            return Err(OrchestrationError::InvalidRunIdentity(format!(
                "run {} is already {}",
                run_id, existing.status
            )));
        }

        info!(
            run_id = %run_id,
            agent = %invocation.agent.id,
            environment = %invocation.agent.environment,
            depth = invocation.chain.depth(),
            "Starting run"
        );

        let mut trace = Trace::default();
        let finish = match self.drive(&invocation, launcher, &mut trace).await {
            Ok(finish) => finish,
            Err(e) => {
                if matches!(e, OrchestrationError::Cancelled) {
                    info!(run_id = %run_id, "Run cancelled");
                } else {
                    error!(run_id = %run_id, agent = %invocation.agent.id, error = %e, "Run failed");
                }
                if let Err(store_err) = self
                    .store
                    .update_run_status(run_id, StatusUpdate::from_error(&e))
                    .await
                {
                    error!(run_id = %run_id, error = %store_err, "Failed to record run failure");
                }
                return Err(e);
            }
        };

        let structured_output = match (&invocation.agent.output_schema, &finish.output) {
            (Some(schema), Some(text)) => {
                let (value, warnings) = structured_output(text, schema);
                for warning in warnings {
                    warn!(run_id = %run_id, "{}", warning);
                    self.store
                        .add_warning(run_id, &warning)
                        .await
                        .map_err(persistence)?;
                }
                value
            }
            _ => None,
        };

        let written = self
            .store
            .update_run_status(
                run_id,
                StatusUpdate::completed(
                    finish.output.clone(),
                    structured_output.clone(),
                    finish.truncated,
                ),
            )
            .await
            .map_err(persistence)?;
        if !written {
            // Cancelled or timed out by the queue while finishing.
            return Err(OrchestrationError::Cancelled);
        }

        info!(
            run_id = %run_id,
            steps = trace.steps.len(),
            truncated = finish.truncated,
            total_tokens = trace.usage.total_tokens,
            "Run completed"
        );

        Ok(RunOutcome {
            run_id,
            status: RunStatus::Completed,
            final_output: finish.output,
            structured_output,
            truncated: finish.truncated,
            steps: trace.steps,
            usage: trace.usage,
        })
    }

    async fn drive(
        &self,
        inv: &RunInvocation,
        launcher: Arc<dyn DelegationLauncher>,
        trace: &mut Trace,
    ) -> Result<Finish> {
        let run_id = inv.run_id;
        check_cancel(&inv.cancel)?;
        self.store
            .update_run_status(run_id, StatusUpdate::running())
            .await
            .map_err(persistence)?;

        let registry =
            ToolRegistry::build(&inv.agent, &inv.chain, &self.pool, &self.resolver, launcher)
                .await?;
        for warning in registry.warnings() {
            warn!(run_id = %run_id, agent = %inv.agent.id, "{}", warning);
            self.store
                .add_warning(run_id, warning)
                .await
                .map_err(persistence)?;
        }

        let definitions = registry.definitions();
        let tools = (!definitions.is_empty()).then_some(definitions.as_slice());
        let model = inv
            .agent
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let max_steps = inv.agent.max_steps.unwrap_or(self.default_max_steps);
        let ctx = ToolContext {
            run_id,
            environment: inv.agent.environment.clone(),
            cancel: inv.cancel.clone(),
        };

        let mut messages = vec![
            ChatMessage::new(Role::System, system_prompt(&inv.agent, &inv.variables)),
            ChatMessage::new(Role::User, inv.input.clone()),
        ];

        let mut turn = 0usize;
        loop {
            check_cancel(&inv.cancel)?;
            if trace.steps.len() >= max_steps {
                return Ok(self.truncated(run_id, max_steps, trace));
            }

            turn += 1;
            debug!(run_id = %run_id, turn, model = %model, "Calling model");
            let response = tokio::select! {
                biased;
                _ = inv.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
                response = self.llm.chat_completion(&model, &messages, tools) => {
                    response.map_err(|e| OrchestrationError::ModelError(e.to_string()))?
                }
            };

            debug!(
                run_id = %run_id,
                turn,
                finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
                "Model replied"
            );
            if let Some(usage) = response.usage {
                trace.usage.add(&usage);
                self.store
                    .record_usage(run_id, &usage)
                    .await
                    .map_err(persistence)?;
            }

            let calls = response.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                return Ok(Finish {
                    output: response.content,
                    truncated: false,
                });
            }

            if let Some(text) = response.content.as_ref().filter(|t| !t.trim().is_empty()) {
                trace.last_text = Some(text.clone());
                self.append(
                    run_id,
                    trace,
                    StepKind::ModelText { text: text.clone() },
                    0,
                )
                .await?;
            }
            messages.push(ChatMessage::assistant_tool_calls(
                response.content,
                calls.clone(),
            ));

            for call in &calls {
                check_cancel(&inv.cancel)?;
                if trace.steps.len() >= max_steps {
                    return Ok(self.truncated(run_id, max_steps, trace));
                }

                let started = Instant::now();
                let (input, result) = self.execute_call(call, &registry, &ctx).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let (output, error, content) = match &result {
                    Ok(output) => (Some(output.clone()), None, output.clone()),
                    Err(e) => (None, Some(e.to_string()), format!("Error: {}", e)),
                };
                debug!(
                    run_id = %run_id,
                    tool = %call.function.name,
                    duration_ms,
                    ok = result.is_ok(),
                    "Tool call finished"
                );
                self.append(
                    run_id,
                    trace,
                    StepKind::ToolCall {
                        tool: call.function.name.clone(),
                        call_id: call.id.clone(),
                        input,
                        output,
                        error,
                    },
                    duration_ms,
                )
                .await?;

                if let Err(e) = result {
                    if e.is_structural() {
                        return Err(e);
                    }
                }
                messages.push(ChatMessage::tool_result(&call.id, content));
            }
        }
    }

    async fn execute_call(
        &self,
        call: &ToolCall,
        registry: &ToolRegistry,
        ctx: &ToolContext,
    ) -> (Value, Result<String>) {
        let name = &call.function.name;
        let raw = call.function.arguments.trim();
        let input = if raw.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(input) => input,
                Err(e) => {
                    let error = OrchestrationError::ToolCallFailed {
                        tool: name.clone(),
                        message: format!("invalid JSON arguments: {}", e),
                    };
                    return (Value::String(raw.to_string()), Err(error));
                }
            }
        };

        // Runs to completion; cancellation is observed before the next step.
        let result = registry.execute(name, input.clone(), ctx).await;
        (input, result)
    }

    async fn append(
        &self,
        run_id: RunId,
        trace: &mut Trace,
        kind: StepKind,
        duration_ms: u64,
    ) -> Result<()> {
        let step = Step {
            seq: trace.steps.len() as u32,
            kind,
            duration_ms,
            at: Utc::now(),
        };
        self.store
            .append_step(run_id, step.clone())
            .await
            .map_err(persistence)?;
        trace.steps.push(step);
        Ok(())
    }

    /// The model gets no extra turn at the limit, so tool results appended
    /// after its last reply are never read and the output is the last
    /// interim text it produced, if any.
    fn truncated(&self, run_id: RunId, max_steps: usize, trace: &Trace) -> Finish {
        warn!(run_id = %run_id, max_steps, "Step limit reached, completing with partial output");
        Finish {
            output: trace.last_text.clone(),
            truncated: true,
        }
    }
}

/// Render `{{name}}` / `{{ .name }}` placeholders; unknown names are left as is.
fn render_prompt(template: &str, variables: &HashMap<String, String>) -> String {
    let Ok(pattern) = Regex::new(r"\{\{\s*\.?([A-Za-z_][A-Za-z0-9_]*)\s*\}\}") else {
        return template.to_string();
    };
    pattern
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn system_prompt(agent: &AgentDefinition, variables: &HashMap<String, String>) -> String {
    let mut prompt = render_prompt(&agent.prompt, variables);
    if let Some(schema) = &agent.output_schema {
        let schema = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        prompt.push_str(&format!(
            "\n\n## Output format\nYour final answer must be a single JSON object matching this schema, with no other text:\n```json\n{}\n```",
            schema
        ));
    }
    prompt
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line.
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse the final answer against an output schema's top-level `required` keys.
fn structured_output(text: &str, schema: &Value) -> (Option<Value>, Vec<String>) {
    let value: Value = match serde_json::from_str(strip_code_fences(text)) {
        Ok(value) => value,
        Err(e) => {
            return (
                None,
                vec![format!("final output is not valid JSON: {}", e)],
            )
        }
    };

    let mut warnings = Vec::new();
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| value.get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            warnings.push(format!(
                "final output is missing required fields: {}",
                missing.join(", ")
            ));
        }
    }
    (Some(value), warnings)
}
