//! Query preprocessing.
//!
//! Binds the session and conversation, resolves the pipeline's model,
//! strips images the model cannot see, fills the variable bag, and
//! assembles the prompt. A `pre-process` plugin event runs before prompt
//! assembly; a plugin that prevents default supplies its own prompt text.

use async_trait::async_trait;
use tracing::{debug, warn};

use relaybot_types::error::Result;
use relaybot_types::message::MessageComponent;
use relaybot_types::provider::{ContentElement, MessageRole, ProviderMessage};

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::pipeline::stage::PipelineStage;
use crate::query::Query;

/// The preprocessor stage.
pub struct PreProcessor {
    system_prompt: Option<String>,
    model_uuid: Option<String>,
}

impl PreProcessor {
    pub fn new(pipeline_config: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            system_prompt: pipeline_config
                .pointer("/ai/local-agent/prompt")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            model_uuid: pipeline_config
                .pointer("/ai/local-agent/model")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    /// The current user turn as a provider message, images included only
    /// when the model can see them.
    fn user_message(query: &Query, vision: bool) -> ProviderMessage {
        let mut content = vec![ContentElement::from_text(query.message_chain.plain_text())];
        if vision {
            for component in &query.message_chain {
                match component {
                    MessageComponent::Image {
                        base64: Some(data), ..
                    } => content.push(ContentElement::ImageBase64 {
                        base64: data.clone(),
                    }),
                    MessageComponent::Image { url: Some(url), .. } => {
                        content.push(ContentElement::ImageUrl { url: url.clone() })
                    }
                    _ => {}
                }
            }
        }
        ProviderMessage {
            role: MessageRole::User,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[async_trait]
impl PipelineStage for PreProcessor {
    async fn process(
        &self,
        ctx: &CoreContext,
        query: &mut Query,
        _inst_name: &str,
    ) -> Result<StageProcessResult> {
        // Bind session + conversation.
        let session = ctx
            .sessions
            .get_session(query.launcher_type, &query.launcher_id);
        let (conversation_id, history) = session.conversation_snapshot().await;
        query.session = Some(session);

        // Bind the model and strip components it cannot handle.
        query.use_llm_model_uuid = self.model_uuid.clone();
        let mut vision = false;
        if let Some(ref model_uuid) = query.use_llm_model_uuid {
            match ctx.models.get_llm(model_uuid) {
                Ok(model) => {
                    vision = model.has_ability("vision");
                    if !vision && query.message_chain.has_image() {
                        debug!(model = %model.name, "model lacks vision; dropping images");
                        query.message_chain = query.message_chain.without_images();
                    }
                }
                Err(e) => warn!(error = %e, "pipeline model not found at preprocess"),
            }
        }

        // Fill the variable bag.
        let user_message_text = query.message_chain.plain_text();
        query.set_variable("session_id", serde_json::json!(query.session_key()));
        query.set_variable("conversation_id", serde_json::json!(conversation_id));
        query.set_variable(
            "msg_create_time",
            serde_json::json!(query.message_event.time()),
        );
        query.set_variable(
            "sender_id",
            serde_json::json!(query.sender_id.to_string()),
        );
        query.set_variable(
            "sender_name",
            serde_json::json!(query.message_event.sender_name()),
        );
        query.set_variable("user_message_text", serde_json::json!(user_message_text));

        // Pre-process plugin event; default behavior assembles the prompt.
        let mut prompt_override: Option<String> = None;
        if let Some(ref plugin) = ctx.plugin {
            let payload = serde_json::json!({
                "query_id": query.query_id,
                "session_id": query.session_key(),
                "user_message_text": user_message_text,
                "variables": query.variables_snapshot(),
            });
            match plugin.emit_event("pre-process", payload, None).await {
                Ok(response) if response.prevented_default => {
                    prompt_override = response
                        .data
                        .get("prompt")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "pre-process event failed; using default prompt"),
            }
        }

        query.prompt.clear();
        match prompt_override {
            Some(text) => query.prompt.push(ProviderMessage::system(text)),
            None => {
                if let Some(ref system) = self.system_prompt {
                    query.prompt.push(ProviderMessage::system(system.clone()));
                }
            }
        }

        // Conversation so far plus the current turn.
        query.messages = history;
        query.messages.push(Self::user_message(query, vision));

        Ok(StageProcessResult::cont())
    }
}
