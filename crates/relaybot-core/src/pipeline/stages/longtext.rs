//! Long-text handling.
//!
//! When the final assistant text exceeds the configured threshold, the
//! reply is either wrapped into a forward-message container (platforms
//! that support it) or split into multiple chains.

use async_trait::async_trait;
use serde::Deserialize;

use relaybot_types::error::Result;
use relaybot_types::message::{ForwardNode, MessageChain, MessageComponent};

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::pipeline::stage::PipelineStage;
use crate::query::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Strategy {
    Forward,
    Split,
}

/// The long-text stage.
pub struct LongTextProcessStage {
    threshold: usize,
    strategy: Strategy,
}

/// Adapters whose converters can express forward containers.
const FORWARD_CAPABLE_ADAPTERS: [&str; 1] = ["wechatpad"];

impl LongTextProcessStage {
    pub fn new(pipeline_config: &serde_json::Value) -> Result<Self> {
        let threshold = pipeline_config
            .pointer("/output/long-text-processing/threshold")
            .and_then(|v| v.as_u64())
            .unwrap_or(256) as usize;
        let strategy = pipeline_config
            .pointer("/output/long-text-processing/strategy")
            .and_then(|v| v.as_str())
            .map(|s| {
                serde_json::from_value(serde_json::Value::String(s.to_string()))
                    .unwrap_or(Strategy::Forward)
            })
            .unwrap_or(Strategy::Forward);
        Ok(Self {
            threshold,
            strategy,
        })
    }

    fn split_text(text: &str, limit: usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(limit.max(1))
            .map(|chunk| chunk.iter().collect())
            .collect()
    }
}

#[async_trait]
impl PipelineStage for LongTextProcessStage {
    async fn process(
        &self,
        _ctx: &CoreContext,
        query: &mut Query,
        _inst_name: &str,
    ) -> Result<StageProcessResult> {
        let mut reshaped = Vec::with_capacity(query.resp_message_chain.len());
        for chain in query.resp_message_chain.drain(..) {
            let text = chain.plain_text();
            if text.chars().count() <= self.threshold {
                reshaped.push(chain);
                continue;
            }

            let forward_supported = FORWARD_CAPABLE_ADAPTERS
                .contains(&query.adapter.adapter_name());
            if self.strategy == Strategy::Forward && forward_supported {
                let nodes = Self::split_text(&text, self.threshold)
                    .into_iter()
                    .map(|part| ForwardNode {
                        sender_id: query.bot_uuid.clone(),
                        sender_name: "bot".into(),
                        time: query.message_event.time(),
                        message_chain: MessageChain::from_text(part),
                    })
                    .collect();
                reshaped.push(MessageChain(vec![MessageComponent::Forward {
                    node_list: nodes,
                }]));
            } else {
                for part in Self::split_text(&text, self.threshold) {
                    reshaped.push(MessageChain::from_text(part));
                }
            }
        }
        query.resp_message_chain = reshaped;
        Ok(StageProcessResult::cont())
    }
}
