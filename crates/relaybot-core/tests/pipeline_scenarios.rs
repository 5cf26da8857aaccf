//! End-to-end pipeline scenarios driven through the WebChat debug bridge.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use relaybot_core::{CoreContext, PipelineManager, Query, QueryPool, SessionManager};
use relaybot_llm::{ModelManager, Requester};
use relaybot_platform::sources::webchat::WebChatAdapter;
use relaybot_platform::{EventKind, ListenerCallback, MessagePlatformAdapter};
use relaybot_types::config::PipelineConfig;
use relaybot_types::error::RequesterError;
use relaybot_types::message::{MessageChain, MessageComponent};
use relaybot_types::provider::{LlmModel, MessageRole, ProviderMessage, ToolSpec};

/// Requester that echoes the last user text and records every request.
struct RecordingEchoRequester {
    seen: Mutex<Vec<Vec<ProviderMessage>>>,
}

impl RecordingEchoRequester {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Requester for RecordingEchoRequester {
    async fn invoke_llm(
        &self,
        _model: &LlmModel,
        messages: &[ProviderMessage],
        _funcs: &[ToolSpec],
        _extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ProviderMessage, RequesterError> {
        self.seen.lock().push(messages.to_vec());
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.plain_text())
            .unwrap_or_default();
        Ok(ProviderMessage::assistant(last_user))
    }
}

struct Harness {
    manager: Arc<PipelineManager>,
    webchat: Arc<WebChatAdapter>,
    requester: Arc<RecordingEchoRequester>,
}

fn full_stage_order() -> Vec<String> {
    [
        "BanSessionCheckStage",
        "RequireRateLimitOccupancy",
        "GroupRespondRuleCheckStage",
        "PreProcessor",
        "Process",
        "LongTextProcessStage",
        "ReleaseRateLimitOccupancy",
        "SendResponseBackStage",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn harness(model_abilities: Vec<&str>, pipeline_config: serde_json::Value) -> Harness {
    let requester = Arc::new(RecordingEchoRequester::new());
    let ctx = CoreContext {
        sessions: Arc::new(SessionManager::new()),
        models: Arc::new(ModelManager::new(
            vec![LlmModel {
                uuid: "m1".into(),
                name: "echo-model".into(),
                abilities: model_abilities.into_iter().map(String::from).collect(),
                api_base: "http://localhost".into(),
                api_key: String::new(),
            }],
            vec![],
        )),
        requester: requester.clone(),
        embedder: None,
        plugin: None,
        kb: None,
        pool: Arc::new(QueryPool::new(8, 8)),
    };
    let manager = Arc::new(PipelineManager::new(Arc::new(ctx)));
    manager
        .load_pipeline(PipelineConfig {
            uuid: "p1".into(),
            name: "scenario".into(),
            is_default: true,
            stages: full_stage_order(),
            config: pipeline_config,
        })
        .unwrap();

    let webchat = Arc::new(WebChatAdapter::new());
    let callback: ListenerCallback = {
        let manager = manager.clone();
        let webchat = webchat.clone();
        Arc::new(move |event, adapter| {
            let manager = manager.clone();
            let pipeline_uuid = webchat.current_pipeline_uuid().unwrap_or_default();
            Box::pin(async move {
                let Some(pipeline) = manager.get_pipeline(&pipeline_uuid) else {
                    return;
                };
                let query = Query::from_event(
                    event,
                    adapter,
                    "bot-e2e",
                    pipeline.entity.uuid.clone(),
                    pipeline.entity.config.clone(),
                );
                let _ = manager.submit(query).await;
            })
        })
    };
    webchat.register_listener(EventKind::FriendMessage, callback.clone());
    webchat.register_listener(EventKind::GroupMessage, callback);

    Harness {
        manager,
        webchat,
        requester,
    }
}

fn base_config(access_control: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "trigger": {
            "access-control": access_control,
            "ratelimit": {"window-length": 1, "limitation": 1},
        },
        "ai": {"local-agent": {"model": "m1"}},
    })
}

#[tokio::test]
async fn whitelisted_person_echo() {
    let h = harness(
        vec![],
        base_config(serde_json::json!({
            "mode": "whitelist",
            // The webchat debug person session.
            "whitelist": ["person_webchatperson"],
        })),
    );

    let reply = h
        .webchat
        .send_debug_message("p1", "person", MessageChain::from_text("hello"))
        .await
        .unwrap();
    assert_eq!(reply.content, "hello");

    // The requester saw exactly one invocation with the user text.
    let seen = h.requester.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].last().unwrap().plain_text(), "hello");
    drop(seen);

    // The run task removes the query right after the reply lands.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.manager.context().pool.is_empty());
}

#[tokio::test]
async fn group_message_without_mention_never_reaches_the_model() {
    let mut config = base_config(serde_json::json!({"mode": "blacklist", "blacklist": []}));
    config["trigger"]["group-respond-rules"] = serde_json::json!({"at-bot": true});
    let h = harness(vec![], config);

    // The sync bridge would wait for a reply that never comes; run the
    // send in the background and observe the pipeline outcome instead.
    let webchat = h.webchat.clone();
    let send = tokio::spawn(async move {
        webchat
            .send_debug_message("p1", "group", MessageChain::from_text("idle chatter"))
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert!(h.requester.seen.lock().is_empty());
    assert!(h.manager.context().pool.is_empty());
    // Debug history holds only the user message: no reply was sent.
    let history = h.webchat.get_debug_messages("group").unwrap();
    assert_eq!(history.len(), 1);
    send.abort();
}

#[tokio::test]
async fn second_rapid_request_is_rate_limited_with_exact_notice() {
    let h = harness(
        vec![],
        base_config(serde_json::json!({"mode": "blacklist", "blacklist": []})),
    );

    let first = h
        .webchat
        .send_debug_message("p1", "person", MessageChain::from_text("one"))
        .await
        .unwrap();
    assert_eq!(first.content, "one");

    // 0.2 s later, same session: the 1-per-second window denies it.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let second = h
        .webchat
        .send_debug_message("p1", "person", MessageChain::from_text("two"))
        .await
        .unwrap();
    assert_eq!(second.content, "请求数超过限速器设定值,已丢弃本消息。");

    // The model only ever saw the first request.
    assert_eq!(h.requester.seen.lock().len(), 1);
}

#[tokio::test]
async fn images_are_stripped_for_models_without_vision() {
    let h = harness(
        // func_call only; no vision.
        vec!["func_call"],
        base_config(serde_json::json!({"mode": "blacklist", "blacklist": []})),
    );

    let chain = MessageChain(vec![
        MessageComponent::plain("describe"),
        MessageComponent::image_base64("aGVsbG8="),
    ]);
    let reply = h
        .webchat
        .send_debug_message("p1", "person", chain)
        .await
        .unwrap();
    assert_eq!(reply.content, "describe");

    let seen = h.requester.seen.lock();
    let user_turn = seen[0]
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .unwrap();
    // Text only; the image never reached the runner.
    assert_eq!(user_turn.content.len(), 1);
    assert_eq!(user_turn.plain_text(), "describe");
}

#[tokio::test]
async fn webchat_sync_reply_matches_ingress_id() {
    let h = harness(
        vec![],
        base_config(serde_json::json!({"mode": "blacklist", "blacklist": []})),
    );

    let reply = h
        .webchat
        .send_debug_message("p1", "person", MessageChain::from_text("hi"))
        .await
        .unwrap();
    assert_eq!(reply.content, "hi");

    let history = h.webchat.get_debug_messages("person").unwrap();
    assert_eq!(history.len(), 2);
    // The reply id is the one allocated at ingress.
    assert_eq!(history[0].id, reply.id);
    assert_eq!(h.webchat.pending_waiters(), 0);
}

#[tokio::test]
async fn sequential_queries_share_one_conversation() {
    let h = harness(
        vec![],
        base_config(serde_json::json!({"mode": "blacklist", "blacklist": []})),
    );

    h.webchat
        .send_debug_message("p1", "person", MessageChain::from_text("first"))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    h.webchat
        .send_debug_message("p1", "person", MessageChain::from_text("second"))
        .await
        .unwrap();

    let seen = h.requester.seen.lock();
    assert_eq!(seen.len(), 2);
    // The second invocation carries the first exchange as history.
    let texts: Vec<String> = seen[1].iter().map(|m| m.plain_text()).collect();
    assert!(texts.contains(&"first".to_string()));
    assert!(texts.contains(&"second".to_string()));
}
