//! LLM-backed reasoning engine.
//!
//! Drives a chat model through four stages (research, draft, critique, finalize). Each
//! stage is a ReAct loop: the model either answers in text, which ends the stage, or calls
//! tools served over an in-process MCP transport, whose results are fed back to it. Every
//! model call consumes one step of the session's budget.

use crate::document::{Document, missing_documents};
use crate::engine::{EngineContext, EngineJob, EngineOutput, ReasoningEngine};
use crate::error::{Result, WorkflowError};
use crate::llm_client::{LLMAction, LLMClient};
use crate::session::{GenerationRequest, Stage};
use crate::tools::{LabToolService, VirtualFs};
use anyhow::Context;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
    FunctionObjectArgs,
};
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How many times the finalize stage re-prompts for documents that are still missing.
const FINALIZE_NUDGES: usize = 2;

/// The prompt templates an [`LlmEngine`] needs, loaded from `prompts/*.md`.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: String,
    pub research: String,
    pub draft: String,
    pub critique: String,
    pub finalize: String,
}

impl PromptSet {
    pub const REQUIRED: [&'static str; 5] =
        ["system_prompt", "research", "draft", "critique", "finalize"];

    pub fn from_map(prompts: &HashMap<String, String>) -> anyhow::Result<Self> {
        let get = |key: &str| {
            prompts
                .get(key)
                .cloned()
                .with_context(|| format!("{key}.md not found in prompts directory"))
        };
        Ok(Self {
            system: get("system_prompt")?,
            research: get("research")?,
            draft: get("draft")?,
            critique: get("critique")?,
            finalize: get("finalize")?,
        })
    }

    fn for_stage(&self, stage: Stage) -> &str {
        match stage {
            Stage::Research => &self.research,
            Stage::Draft => &self.draft,
            Stage::Critique => &self.critique,
            _ => &self.finalize,
        }
    }
}

/// Fills `{description}`, `{student_name}`, `{grade_level}` and `{documents}` in a template.
pub fn render_prompt(template: &str, request: &GenerationRequest, targets: &[Document]) -> String {
    let documents = targets
        .iter()
        .map(|doc| format!("- `{}`: {}", doc.file_name(), doc.purpose()))
        .collect::<Vec<_>>()
        .join("\n");
    template
        .replace("{description}", &request.description)
        .replace(
            "{student_name}",
            request.student_name.as_deref().unwrap_or("the student"),
        )
        .replace("{grade_level}", &request.grade_level)
        .replace("{documents}", &documents)
}

pub struct LlmEngine {
    client: Arc<dyn LLMClient>,
    prompts: Arc<PromptSet>,
}

impl LlmEngine {
    pub fn new(client: Arc<dyn LLMClient>, prompts: Arc<PromptSet>) -> Self {
        Self { client, prompts }
    }

    async fn generate(
        &self,
        job: &EngineJob,
        ctx: &EngineContext,
    ) -> anyhow::Result<EngineOutput> {
        let fs = VirtualFs::new();
        let service = LabToolService::new(ctx.clone(), fs.clone());
        let (server_transport, client_transport) = tokio::io::duplex(4096);

        let tool_server = tokio::spawn(async move {
            if let Ok(service) = service.serve(server_transport).await {
                let _ = service.waiting().await;
            }
        });
        let mcp_client = ().serve(client_transport).await?;
        let result = self.run_stages(job, ctx, &fs, &mcp_client).await;

        let _ = mcp_client.cancel().await;
        tool_server.abort();
        result?;

        Ok(EngineOutput {
            files: fs.output_files(),
        })
    }

    async fn run_stages(
        &self,
        job: &EngineJob,
        ctx: &EngineContext,
        fs: &VirtualFs,
        mcp_client: &RunningService<RoleClient, ()>,
    ) -> anyhow::Result<()> {
        let tools = list_tools(mcp_client).await?;
        let model = job.request.model.as_deref();

        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(render_prompt(&self.prompts.system, &job.request, &job.targets))
                .build()?
                .into(),
        ];

        for (stage, announcement) in [
            (Stage::Research, "Researching the experiment"),
            (Stage::Draft, "Drafting documents"),
            (Stage::Critique, "Reviewing drafts"),
            (Stage::Finalize, "Finalizing documents"),
        ] {
            ctx.stage(stage, announcement);
            let prompt = render_prompt(self.prompts.for_stage(stage), &job.request, &job.targets);
            push_user(&mut messages, prompt)?;
            self.react(ctx, model, &mut messages, &tools, mcp_client)
                .await?;
        }

        for _ in 0..FINALIZE_NUDGES {
            let written = fs.output_files();
            let missing = missing_documents(written.keys().map(String::as_str));
            if missing.is_empty() {
                break;
            }
            let names: Vec<&str> = missing.iter().map(|d| d.file_name()).collect();
            warn!(missing = ?names, "Documents still missing after finalize");
            ctx.progress(format!("Writing missing documents: {}", names.join(", ")));
            push_user(
                &mut messages,
                format!(
                    "These required documents have not been written yet: {}. Write each of them now with write_file.",
                    names.join(", ")
                ),
            )?;
            self.react(ctx, model, &mut messages, &tools, mcp_client)
                .await?;
        }
        Ok(())
    }

    /// Runs model turns until the model answers with plain text.
    async fn react(
        &self,
        ctx: &EngineContext,
        model: Option<&str>,
        messages: &mut Vec<ChatCompletionRequestMessage>,
        tools: &[ChatCompletionTool],
        mcp_client: &RunningService<RoleClient, ()>,
    ) -> anyhow::Result<()> {
        loop {
            let step = ctx.step()?;
            debug!(step, stage = %ctx.current_stage(), "Model turn");
            let action = self
                .client
                .decide_action(model, messages.clone(), tools.to_vec())
                .await?;

            let tool_calls = match action {
                LLMAction::TextResponse(text) => {
                    messages.push(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(text)
                            .build()?
                            .into(),
                    );
                    return Ok(());
                }
                LLMAction::ToolCall(tool_calls) => tool_calls,
            };

            let mut results = Vec::with_capacity(tool_calls.len());
            for call in &tool_calls {
                let result =
                    call_tool(mcp_client, &call.function.name, &call.function.arguments).await?;
                results.push(result);
            }

            messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .tool_calls(tool_calls.clone())
                    .build()?
                    .into(),
            );
            for (call, result) in tool_calls.iter().zip(results) {
                messages.push(
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(call.id.clone())
                        .content(result)
                        .build()?
                        .into(),
                );
            }
        }
    }
}

fn push_user(messages: &mut Vec<ChatCompletionRequestMessage>, text: String) -> anyhow::Result<()> {
    messages.push(
        ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()?
            .into(),
    );
    Ok(())
}

async fn list_tools(
    mcp_client: &RunningService<RoleClient, ()>,
) -> anyhow::Result<Vec<ChatCompletionTool>> {
    mcp_client
        .list_all_tools()
        .await?
        .into_iter()
        .map(|t| {
            Ok(ChatCompletionToolArgs::default()
                .function(
                    FunctionObjectArgs::default()
                        .name(t.name)
                        .description(t.description.unwrap_or_default())
                        .parameters(serde_json::to_value(&*t.input_schema)?)
                        .build()?,
                )
                .build()?)
        })
        .collect()
}

/// Calls one tool and returns its text output. Malformed arguments are reported back to
/// the model rather than aborting the run.
async fn call_tool(
    mcp_client: &RunningService<RoleClient, ()>,
    name: &str,
    arguments: &str,
) -> anyhow::Result<String> {
    let arguments = match serde_json::from_str(if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    }) {
        Ok(args) => args,
        Err(e) => return Ok(format!("{{\"error\": \"Invalid JSON arguments: {e}\"}}")),
    };
    let result = mcp_client
        .peer()
        .call_tool(CallToolRequestParam {
            name: name.to_string().into(),
            arguments: Some(arguments),
        })
        .await?;

    let annotated_content = result
        .content
        .context("Tool call returned no content")?
        .pop()
        .context("Content list was empty")?;
    Ok(match annotated_content.raw {
        RawContent::Text(text_content) => text_content.text,
        _ => "{\"error\": \"Unexpected content type from tool\"}".to_string(),
    })
}

#[async_trait]
impl ReasoningEngine for LlmEngine {
    fn name(&self) -> &'static str {
        "llm"
    }

    #[instrument(name = "llm_engine", skip_all, fields(session_id = %job.session_id))]
    async fn run(&self, job: &EngineJob, ctx: &EngineContext) -> Result<EngineOutput> {
        info!(budget = job.step_budget, "Starting generation");
        match self.generate(job, ctx).await {
            Ok(output) => {
                info!(
                    files = output.files.len(),
                    steps = ctx.meter().used(),
                    "Generation finished"
                );
                Ok(output)
            }
            Err(e) => Err(match e.downcast::<WorkflowError>() {
                Ok(workflow) => workflow,
                Err(other) => WorkflowError::Engine(format!("{other:#}")),
            }),
        }
    }
}
