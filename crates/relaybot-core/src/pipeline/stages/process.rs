//! The model invocation stage.
//!
//! Selects a runner per pipeline config (`ai.runner.runner`, default
//! `local-agent`). The local agent runner injects retrieval context when
//! the pipeline names knowledge bases, then loops on tool calls: each
//! tool the model requests is dispatched through the plugin connector and
//! fed back as a tool-role message until the model stops or the budget
//! expires. Cancellation is polled between rounds.

use async_trait::async_trait;
use tracing::{debug, warn};

use relaybot_types::error::{RelayError, Result};
use relaybot_types::message::MessageChain;
use relaybot_types::provider::{ProviderMessage, ToolSpec};

use relaybot_llm::Requester as _;
use relaybot_plugin::Action;

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::pipeline::stage::PipelineStage;
use crate::query::Query;

/// Hard cap on tool-call rounds per query.
const DEFAULT_TOOL_BUDGET: usize = 10;

/// The process stage.
pub struct Process {
    runner: String,
    knowledge_bases: Vec<String>,
    tool_budget: usize,
    extra_args: serde_json::Map<String, serde_json::Value>,
}

impl Process {
    pub fn new(pipeline_config: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            runner: pipeline_config
                .pointer("/ai/runner/runner")
                .and_then(|v| v.as_str())
                .unwrap_or("local-agent")
                .to_string(),
            knowledge_bases: pipeline_config
                .pointer("/ai/local-agent/knowledge-bases")
                .and_then(|v| v.as_array())
                .map(|kbs| {
                    kbs.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            tool_budget: pipeline_config
                .pointer("/ai/local-agent/max-tool-calls")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_TOOL_BUDGET),
            extra_args: pipeline_config
                .pointer("/ai/local-agent/extra-args")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Retrieve context from every configured knowledge base and fold it
    /// into the final user turn. Retrieval failures degrade to no-RAG
    /// rather than failing the query.
    async fn inject_retrieval_context(&self, ctx: &CoreContext, query: &mut Query) {
        let Some(ref kb_manager) = ctx.kb else {
            return;
        };
        let user_text = query
            .variable("user_message_text")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if user_text.is_empty() {
            return;
        }

        let mut snippets = Vec::new();
        for kb_uuid in &self.knowledge_bases {
            match kb_manager
                .retrieve(kb_uuid, &user_text, None, serde_json::json!({}))
                .await
            {
                Ok(entries) => {
                    for entry in entries {
                        let text = entry.text();
                        if !text.is_empty() {
                            snippets.push(text);
                        }
                    }
                }
                Err(e) => {
                    warn!(kb = %kb_uuid, error = %e, "retrieval failed; continuing without it")
                }
            }
        }
        if snippets.is_empty() {
            return;
        }

        let context_block = format!(
            "Relevant knowledge:\n{}\n\nUser message:\n{user_text}",
            snippets.join("\n---\n")
        );
        if let Some(last) = query.messages.last_mut() {
            if let Some(first) = last.content.first_mut() {
                *first = relaybot_types::provider::ContentElement::from_text(context_block);
                return;
            }
        }
        query.messages.push(ProviderMessage::user(context_block));
    }

    /// Tools advertised by the plugin runtime, empty when disabled.
    async fn available_tools(&self, ctx: &CoreContext) -> Vec<ToolSpec> {
        let Some(ref plugin) = ctx.plugin else {
            return Vec::new();
        };
        match plugin.call_action(Action::ListTools, serde_json::json!({})).await {
            Ok(data) => data
                .get("tools")
                .and_then(|v| v.as_array())
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(|t| serde_json::from_value(t.clone()).ok())
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "tool listing failed; invoking without tools");
                Vec::new()
            }
        }
    }

    async fn run_local_agent(&self, ctx: &CoreContext, query: &mut Query) -> Result<()> {
        let model_uuid = query.use_llm_model_uuid.clone().ok_or_else(|| {
            RelayError::ConfigInvalid {
                reason: "pipeline has no model bound (ai.local-agent.model)".into(),
            }
        })?;
        let model = ctx.models.get_llm(&model_uuid)?.clone();

        self.inject_retrieval_context(ctx, query).await;
        let funcs = self.available_tools(ctx).await;

        let mut messages: Vec<ProviderMessage> = query
            .prompt
            .iter()
            .chain(query.messages.iter())
            .cloned()
            .collect();

        for round in 0..=self.tool_budget {
            if ctx.pool.is_interrupted(query.query_id) {
                return Err(RelayError::Cancelled);
            }

            let reply = ctx
                .requester
                .invoke_llm(&model, &messages, &funcs, &self.extra_args)
                .await?;

            query.resp_messages.push(reply.clone());
            messages.push(reply.clone());

            if reply.tool_calls.is_empty() {
                let text = reply.plain_text();
                if !text.is_empty() {
                    query
                        .resp_message_chain
                        .push(MessageChain::from_text(text));
                }
                return Ok(());
            }

            if round == self.tool_budget {
                warn!(query_id = query.query_id, "tool budget exhausted");
                break;
            }

            let Some(ref plugin) = ctx.plugin else {
                return Err(RelayError::Plugin(
                    "model requested tools but the plugin runtime is disabled".into(),
                ));
            };
            for call in &reply.tool_calls {
                debug!(tool = %call.name, query_id = query.query_id, "dispatching tool call");
                let outcome = plugin
                    .call_action(
                        Action::CallTool,
                        serde_json::json!({
                            "name": call.name,
                            "params": call.arguments,
                            "session_id": query.session_key(),
                            "query_id": query.query_id,
                        }),
                    )
                    .await;
                let result_text = match outcome {
                    Ok(data) => data.to_string(),
                    Err(e) => format!("tool error: {e}"),
                };
                messages.push(ProviderMessage::tool_result(call.id.clone(), result_text));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStage for Process {
    async fn process(
        &self,
        ctx: &CoreContext,
        query: &mut Query,
        _inst_name: &str,
    ) -> Result<StageProcessResult> {
        match self.runner.as_str() {
            "local-agent" => self.run_local_agent(ctx, query).await?,
            other => {
                return Err(RelayError::ConfigInvalid {
                    reason: format!("unknown runner {other:?}"),
                })
            }
        }

        // Record the exchange on the conversation.
        if let Some(ref session) = query.session {
            let mut exchanged = Vec::new();
            if let Some(last_user) = query.messages.last() {
                exchanged.push(last_user.clone());
            }
            exchanged.extend(query.resp_messages.iter().cloned());
            session.append_messages(&exchanged).await;
        }

        Ok(StageProcessResult::cont())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::entities::ResultType;
    use crate::pipeline::stages::testing::{person_query, test_context, EchoRequester};
    use crate::query::QueryPool;
    use relaybot_llm::ModelManager;
    use relaybot_types::provider::LlmModel;
    use std::sync::Arc;

    fn ctx() -> CoreContext {
        let mut ctx = test_context();
        ctx.models = Arc::new(ModelManager::new(
            vec![LlmModel {
                uuid: "m1".into(),
                name: "echo".into(),
                abilities: vec![],
                api_base: "http://localhost".into(),
                api_key: String::new(),
            }],
            vec![],
        ));
        ctx
    }

    fn prepared_query(text: &str) -> Query {
        let mut query = person_query("42", text);
        query.use_llm_model_uuid = Some("m1".into());
        query.messages = vec![ProviderMessage::user(text)];
        query.set_variable("user_message_text", serde_json::json!(text));
        query
    }

    #[tokio::test]
    async fn local_agent_produces_reply_chain() {
        let ctx = ctx();
        let stage = Process::new(&serde_json::json!({})).unwrap();
        let mut query = prepared_query("hello");

        let result = stage.process(&ctx, &mut query, "Process").await.unwrap();
        assert_eq!(result.result_type, ResultType::Continue);
        assert_eq!(query.resp_messages.len(), 1);
        assert_eq!(query.resp_message_chain.len(), 1);
        assert_eq!(query.resp_message_chain[0].plain_text(), "hello");
    }

    #[tokio::test]
    async fn missing_model_is_config_error() {
        let ctx = ctx();
        let stage = Process::new(&serde_json::json!({})).unwrap();
        let mut query = person_query("42", "hello");
        // No model bound.
        let err = stage.process(&ctx, &mut query, "Process").await.unwrap_err();
        assert!(matches!(err, RelayError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn interrupted_query_cancels_before_invocation() {
        let mut ctx = ctx();
        let pool = Arc::new(QueryPool::new(4, 4));
        ctx.pool = pool.clone();

        let stage = Process::new(&serde_json::json!({})).unwrap();
        let mut query = prepared_query("hello");
        query.query_id = 7;
        pool.interrupt(7);

        let err = stage.process(&ctx, &mut query, "Process").await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
        assert!(query.resp_message_chain.is_empty());
    }

    #[tokio::test]
    async fn unknown_runner_rejected() {
        let ctx = ctx();
        let stage =
            Process::new(&serde_json::json!({"ai": {"runner": {"runner": "dify"}}})).unwrap();
        let mut query = prepared_query("x");
        let err = stage.process(&ctx, &mut query, "Process").await.unwrap_err();
        assert!(matches!(err, RelayError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn exchange_is_recorded_on_conversation() {
        let ctx = ctx();
        let stage = Process::new(&serde_json::json!({})).unwrap();
        let mut query = prepared_query("remember me");
        let session = ctx
            .sessions
            .get_session(relaybot_types::event::LauncherType::Person, "42");
        query.session = Some(session.clone());

        stage.process(&ctx, &mut query, "Process").await.unwrap();

        let (_, messages) = session.conversation_snapshot().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].plain_text(), "remember me");
        assert_eq!(messages[1].plain_text(), "remember me");
    }

    #[tokio::test]
    async fn echo_requester_sees_prompt_and_messages() {
        let mut ctx = ctx();
        ctx.requester = Arc::new(EchoRequester {
            prefix: "echo: ".into(),
        });
        let stage = Process::new(&serde_json::json!({})).unwrap();
        let mut query = prepared_query("ping");
        query.prompt = vec![ProviderMessage::system("sys")];

        stage.process(&ctx, &mut query, "Process").await.unwrap();
        assert_eq!(query.resp_message_chain[0].plain_text(), "echo: ping");
    }
}
