//! Response delivery.
//!
//! Sends each reply frame through the originating adapter, honouring
//! `output.misc.at-sender`, `output.misc.quote-origin`, and the optional
//! `output.force-delay` range. Per-frame delivery errors are logged and
//! the stage continues; the delivery outcome never interrupts the
//! pipeline from here.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, info};

use relaybot_platform::MessagePlatformAdapter as _;
use relaybot_types::error::Result;
use relaybot_types::event::LauncherType;
use relaybot_types::message::{MessageChain, MessageComponent};

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::pipeline::stage::PipelineStage;
use crate::query::Query;

/// The send-response-back stage.
pub struct SendResponseBackStage {
    at_sender: bool,
    quote_origin: bool,
    delay_range: Option<(f64, f64)>,
}

impl SendResponseBackStage {
    pub fn new(pipeline_config: &serde_json::Value) -> Result<Self> {
        let at_sender = pipeline_config
            .pointer("/output/misc/at-sender")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let quote_origin = pipeline_config
            .pointer("/output/misc/quote-origin")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let delay_range = pipeline_config.pointer("/output/force-delay").and_then(|v| {
            let min = v.get("min")?.as_f64()?;
            let max = v.get("max")?.as_f64()?;
            (max >= min && min >= 0.0).then_some((min, max))
        });
        Ok(Self {
            at_sender,
            quote_origin,
            delay_range,
        })
    }

    async fn apply_delay(&self) {
        if let Some((min, max)) = self.delay_range {
            let seconds = if max > min {
                rand::thread_rng().gen_range(min..=max)
            } else {
                min
            };
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        }
    }
}

#[async_trait]
impl PipelineStage for SendResponseBackStage {
    async fn process(
        &self,
        _ctx: &CoreContext,
        query: &mut Query,
        _inst_name: &str,
    ) -> Result<StageProcessResult> {
        let frames = std::mem::take(&mut query.resp_message_chain);
        for chain in frames {
            self.apply_delay().await;

            let chain = if self.at_sender && query.launcher_type == LauncherType::Group {
                let mut components = vec![MessageComponent::at(query.sender_id.clone())];
                components.extend(chain.0);
                MessageChain(components)
            } else {
                chain
            };

            if let Err(e) = query
                .adapter
                .reply_message(&query.message_event, chain, self.quote_origin)
                .await
            {
                error!(query_id = query.query_id, error = %e, "reply delivery failed");
            } else {
                info!(query_id = query.query_id, "reply delivered");
            }
        }
        Ok(StageProcessResult::cont())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::entities::ResultType;
    use crate::pipeline::stages::testing::{group_query, person_query, test_context};
    use parking_lot::Mutex;
    use relaybot_platform::{
        EventKind, ListenerCallback, MessagePlatformAdapter, WebhookRequest, WebhookResponse,
    };
    use relaybot_types::event::Event;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Adapter that records what it was asked to deliver.
    #[derive(Default)]
    struct RecordingAdapter {
        replies: Mutex<Vec<(MessageChain, bool)>>,
        fail: bool,
    }

    #[async_trait]
    impl MessagePlatformAdapter for RecordingAdapter {
        fn adapter_name(&self) -> &'static str {
            "recording"
        }
        async fn send_message(
            &self,
            _target_type: LauncherType,
            _target_id: &str,
            _chain: MessageChain,
        ) -> Result<()> {
            Ok(())
        }
        async fn reply_message(
            &self,
            _source_event: &Event,
            chain: MessageChain,
            quote_origin: bool,
        ) -> Result<()> {
            if self.fail {
                return Err(relaybot_types::RelayError::Other("platform down".into()));
            }
            self.replies.lock().push((chain, quote_origin));
            Ok(())
        }
        fn register_listener(&self, _kind: EventKind, _callback: ListenerCallback) {}
        fn unregister_listener(&self, _kind: EventKind) {}
        async fn handle_unified_webhook(
            &self,
            _bot_uuid: &str,
            _path: &str,
            _request: WebhookRequest,
        ) -> Result<WebhookResponse> {
            unreachable!()
        }
        async fn run_async(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }
        fn set_bot_uuid(&self, _uuid: String) {}
        async fn kill(&self) -> Result<()> {
            Ok(())
        }
    }

    fn stage(config: serde_json::Value) -> SendResponseBackStage {
        SendResponseBackStage::new(&config).unwrap()
    }

    #[tokio::test]
    async fn delivers_each_frame() {
        let ctx = test_context();
        let adapter = Arc::new(RecordingAdapter::default());
        let mut query = person_query("42", "q");
        query.adapter = adapter.clone();
        query.resp_message_chain = vec![
            MessageChain::from_text("one"),
            MessageChain::from_text("two"),
        ];

        let result = stage(serde_json::json!({}))
            .process(&ctx, &mut query, "SendResponseBackStage")
            .await
            .unwrap();
        assert_eq!(result.result_type, ResultType::Continue);

        let replies = adapter.replies.lock();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0.plain_text(), "one");
        assert!(!replies[0].1);
    }

    #[tokio::test]
    async fn at_sender_prepends_mention_in_groups() {
        let ctx = test_context();
        let adapter = Arc::new(RecordingAdapter::default());
        let mut query = group_query("g1", "42", "q");
        query.adapter = adapter.clone();
        query.resp_message_chain = vec![MessageChain::from_text("answer")];

        stage(serde_json::json!({"output": {"misc": {"at-sender": true}}}))
            .process(&ctx, &mut query, "SendResponseBackStage")
            .await
            .unwrap();

        let replies = adapter.replies.lock();
        assert_eq!(replies[0].0.first_at(), Some("42"));
    }

    #[tokio::test]
    async fn at_sender_skipped_for_person_chats() {
        let ctx = test_context();
        let adapter = Arc::new(RecordingAdapter::default());
        let mut query = person_query("42", "q");
        query.adapter = adapter.clone();
        query.resp_message_chain = vec![MessageChain::from_text("answer")];

        stage(serde_json::json!({"output": {"misc": {"at-sender": true}}}))
            .process(&ctx, &mut query, "SendResponseBackStage")
            .await
            .unwrap();
        assert!(adapter.replies.lock()[0].0.first_at().is_none());
    }

    #[tokio::test]
    async fn quote_origin_flag_passed_to_adapter() {
        let ctx = test_context();
        let adapter = Arc::new(RecordingAdapter::default());
        let mut query = person_query("42", "q");
        query.adapter = adapter.clone();
        query.resp_message_chain = vec![MessageChain::from_text("x")];

        stage(serde_json::json!({"output": {"misc": {"quote-origin": true}}}))
            .process(&ctx, &mut query, "SendResponseBackStage")
            .await
            .unwrap();
        assert!(adapter.replies.lock()[0].1);
    }

    #[tokio::test]
    async fn per_frame_errors_do_not_interrupt() {
        let ctx = test_context();
        let adapter = Arc::new(RecordingAdapter {
            fail: true,
            ..Default::default()
        });
        let mut query = person_query("42", "q");
        query.adapter = adapter;
        query.resp_message_chain = vec![MessageChain::from_text("x")];

        let result = stage(serde_json::json!({}))
            .process(&ctx, &mut query, "SendResponseBackStage")
            .await
            .unwrap();
        assert_eq!(result.result_type, ResultType::Continue);
    }

    #[tokio::test]
    async fn force_delay_sleeps_within_range() {
        let ctx = test_context();
        let adapter = Arc::new(RecordingAdapter::default());
        let mut query = person_query("42", "q");
        query.adapter = adapter.clone();
        query.resp_message_chain = vec![MessageChain::from_text("slow")];

        let start = std::time::Instant::now();
        stage(serde_json::json!({"output": {"force-delay": {"min": 0.05, "max": 0.1}}}))
            .process(&ctx, &mut query, "SendResponseBackStage")
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert_eq!(adapter.replies.lock().len(), 1);
    }
}
