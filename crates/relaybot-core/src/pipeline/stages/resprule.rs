//! Group-trigger rules.
//!
//! Personal messages pass unconditionally. Group messages walk an ordered
//! rule-matcher list; the first match wins and may replace the query's
//! chain. No match means a silent drop.

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;

use relaybot_types::error::{RelayError, Result};
use relaybot_types::event::LauncherType;
use relaybot_types::message::{MessageChain, MessageComponent};

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::pipeline::stage::PipelineStage;
use crate::query::Query;

/// Outcome of one rule matcher.
struct RuleMatch {
    matching: bool,
    replacement: Option<MessageChain>,
}

impl RuleMatch {
    fn no() -> Self {
        Self {
            matching: false,
            replacement: None,
        }
    }

    fn yes(replacement: Option<MessageChain>) -> Self {
        Self {
            matching: true,
            replacement,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RespondRules {
    /// Respond when the bot is mentioned.
    #[serde(rename = "at-bot", default)]
    at_bot: bool,
    /// Respond when the text starts with one of these prefixes; the
    /// prefix is stripped from the forwarded chain.
    #[serde(default)]
    prefix: Vec<String>,
    /// Respond when the text matches one of these patterns.
    #[serde(default)]
    regexp: Vec<String>,
    /// Respond with this probability even without other matches.
    #[serde(default)]
    random: f64,
}

/// The group-respond-rule stage.
#[derive(Debug)]
pub struct GroupRespondRuleCheckStage {
    rules: RespondRules,
    patterns: Vec<Regex>,
}

impl GroupRespondRuleCheckStage {
    pub fn new(pipeline_config: &serde_json::Value) -> Result<Self> {
        let rules: RespondRules = pipeline_config
            .pointer("/trigger/group-respond-rules")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let patterns = rules
            .regexp
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| RelayError::ConfigInvalid {
                    reason: format!("bad group-respond regexp {p:?}: {e}"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, patterns })
    }

    /// Mention rule: matches `At`/`AtAll` aimed at the bot; the mention
    /// components are stripped from the forwarded chain.
    fn match_at_bot(&self, chain: &MessageChain) -> RuleMatch {
        if !self.rules.at_bot {
            return RuleMatch::no();
        }
        let mentioned = chain
            .iter()
            .any(|c| matches!(c, MessageComponent::At { .. } | MessageComponent::AtAll));
        if !mentioned {
            return RuleMatch::no();
        }
        let stripped = MessageChain(
            chain
                .iter()
                .filter(|c| !matches!(c, MessageComponent::At { .. } | MessageComponent::AtAll))
                .cloned()
                .collect(),
        );
        RuleMatch::yes(Some(stripped))
    }

    fn match_prefix(&self, chain: &MessageChain) -> RuleMatch {
        let text = chain.plain_text();
        for prefix in &self.rules.prefix {
            if let Some(rest) = text.strip_prefix(prefix.as_str()) {
                let mut replaced = MessageChain(
                    chain
                        .iter()
                        .filter(|c| !matches!(c, MessageComponent::Plain { .. }))
                        .cloned()
                        .collect(),
                );
                replaced.push(MessageComponent::plain(rest));
                return RuleMatch::yes(Some(replaced));
            }
        }
        RuleMatch::no()
    }

    fn match_regexp(&self, chain: &MessageChain) -> RuleMatch {
        let text = chain.plain_text();
        for pattern in &self.patterns {
            if pattern.is_match(&text) {
                return RuleMatch::yes(None);
            }
        }
        RuleMatch::no()
    }

    fn match_random(&self) -> RuleMatch {
        if self.rules.random > 0.0 && rand::thread_rng().gen::<f64>() < self.rules.random {
            return RuleMatch::yes(None);
        }
        RuleMatch::no()
    }
}

#[async_trait]
impl PipelineStage for GroupRespondRuleCheckStage {
    async fn process(
        &self,
        _ctx: &CoreContext,
        query: &mut Query,
        _inst_name: &str,
    ) -> Result<StageProcessResult> {
        if query.launcher_type != LauncherType::Group {
            return Ok(StageProcessResult::cont());
        }

        let chain = query.message_chain.clone();
        // Ordered matcher walk; first match wins.
        let matchers: [RuleMatch; 4] = [
            self.match_at_bot(&chain),
            self.match_prefix(&chain),
            self.match_regexp(&chain),
            self.match_random(),
        ];
        for rule_match in matchers {
            if rule_match.matching {
                if let Some(replacement) = rule_match.replacement {
                    query.message_chain = replacement;
                }
                return Ok(StageProcessResult::cont());
            }
        }

        // Silent drop: the group message did not address the bot.
        Ok(StageProcessResult::interrupt())
    }
}
