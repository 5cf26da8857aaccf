//! The relaybot gateway binary.
//!
//! Loads config (TOML + env overrides), wires the component graph, and
//! serves the HTTP surface until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relaybot_api::{ApiState, StaticTokenValidator, WsConnectionPool};
use relaybot_core::{
    CoreContext, CoreHostHandler, PipelineManager, Query, QueryPool, SessionManager,
};
use relaybot_llm::{ModelManager, OpenAiCompatRequester, RetryConfig};
use relaybot_platform::{
    EventKind, ListenerCallback, MessagePlatformAdapter, PlatformManager, RuntimeBot,
};
use relaybot_plugin::PluginConnector;
use relaybot_rag::{KnowledgeBaseManager, LocalRagEngine, LocalStorage, MemoryMetadataStore};
use relaybot_types::config::AppConfig;
use relaybot_vdb::VdbManager;

#[derive(Parser, Debug)]
#[command(name = "relaybot", about = "Multi-platform chatbot gateway", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("relaybot={default_level},info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = if args.config.exists() {
        AppConfig::load(&args.config)
            .with_context(|| format!("loading config {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file missing; using defaults");
        AppConfig::default()
    };

    let cancel = CancellationToken::new();

    // Model + requester layer.
    let models = Arc::new(ModelManager::new(
        config.llm_models.clone(),
        config.embedding_models.clone(),
    ));
    let requester = Arc::new(OpenAiCompatRequester::new(RetryConfig::default()));

    // Vector store + knowledge bases.
    let vdb = Arc::new(VdbManager::from_config(&config.vdb)?);
    let storage = Arc::new(LocalStorage::new(&config.storage.base_dir));
    let metadata = Arc::new(MemoryMetadataStore::new());
    let mut kb_manager = KnowledgeBaseManager::new(metadata, storage.clone());
    kb_manager.register_engine(
        "local",
        Arc::new(LocalRagEngine::new(
            vdb.clone(),
            models.clone(),
            requester.clone(),
            storage,
        )),
    );
    kb_manager.load_from_store().await?;
    let kb_manager = Arc::new(kb_manager);

    // Query + session core.
    let pool = Arc::new(QueryPool::new(
        config.concurrency.pipeline,
        config.concurrency.queue_depth,
    ));
    let sessions = Arc::new(SessionManager::new());

    // Plugin runtime connection.
    let plugin = if config.plugin.enable {
        let host = Arc::new(CoreHostHandler::new(
            pool.clone(),
            sessions.clone(),
            models.clone(),
        ));
        Some(Arc::new(PluginConnector::new(
            config.plugin.runtime_ws_url.clone(),
            host,
        )))
    } else {
        None
    };

    let ctx = Arc::new(CoreContext {
        sessions,
        models,
        requester: requester.clone(),
        embedder: Some(requester),
        plugin,
        kb: Some(kb_manager),
        pool,
    });

    // Pipelines.
    let pipelines = Arc::new(PipelineManager::new(ctx.clone()));
    for entity in &config.pipelines {
        pipelines.load_pipeline(entity.clone())?;
    }

    // Platform bots.
    let platform = Arc::new(PlatformManager::new());
    for bot_config in &config.bots {
        match platform.load_bot(bot_config, cancel.child_token()) {
            Ok(bot) => install_listeners(&bot, &pipelines),
            Err(e) => warn!(bot = %bot_config.uuid, error = %e, "bot failed to load"),
        }
    }
    // The implicit WebChat debug bot routes through whatever pipeline the
    // console selected per send.
    if let Some(webchat_bot) =
        platform.get_bot_by_uuid(relaybot_platform::manager::WEBCHAT_BOT_UUID)
    {
        install_webchat_listeners(&platform, &webchat_bot, &pipelines);
    }

    // HTTP surface.
    let state = ApiState {
        platform,
        pipelines,
        ws_pool: Arc::new(WsConnectionPool::new(std::time::Duration::from_secs(120))),
        auth: Arc::new(StaticTokenValidator::new(None)),
    };

    // Periodic stale-connection sweep.
    {
        let ws_pool = state.ws_pool.clone();
        let sweep_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        ws_pool.cleanup_stale_connections().await;
                    }
                    _ = sweep_cancel.cancelled() => break,
                }
            }
        });
    }

    let router = relaybot_api::build_router(state);
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "relaybot listening");

    let shutdown = cancel.clone();
    tokio::select! {
        result = axum::serve(listener, router) => {
            result.context("http server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.cancel();
        }
    }

    Ok(())
}

/// Wire a configured bot's inbound events into its bound pipeline.
fn install_listeners(bot: &Arc<RuntimeBot>, pipelines: &Arc<PipelineManager>) {
    let callback = make_listener(pipelines.clone(), {
        let bot = bot.clone();
        move || (bot.uuid.clone(), bot.pipeline_uuid())
    });
    bot.adapter.register_listener(EventKind::FriendMessage, callback.clone());
    bot.adapter.register_listener(EventKind::GroupMessage, callback);
}

/// The WebChat bot resolves its pipeline per debug send.
fn install_webchat_listeners(
    platform: &Arc<PlatformManager>,
    bot: &Arc<RuntimeBot>,
    pipelines: &Arc<PipelineManager>,
) {
    let webchat = platform.webchat_adapter();
    let bot_uuid = bot.uuid.clone();
    let callback = make_listener(pipelines.clone(), move || {
        (bot_uuid.clone(), webchat.current_pipeline_uuid())
    });
    bot.adapter.register_listener(EventKind::FriendMessage, callback.clone());
    bot.adapter.register_listener(EventKind::GroupMessage, callback);
}

/// Build the listener callback: resolve the pipeline, construct the
/// query, and submit it to the scheduler.
fn make_listener<F>(pipelines: Arc<PipelineManager>, resolve: F) -> ListenerCallback
where
    F: Fn() -> (String, Option<String>) + Send + Sync + 'static,
{
    Arc::new(move |event, adapter| {
        let pipelines = pipelines.clone();
        let (bot_uuid, pipeline_uuid) = resolve();
        Box::pin(async move {
            let pipeline = match pipeline_uuid
                .and_then(|uuid| pipelines.get_pipeline(&uuid))
                .or_else(|| pipelines.default_pipeline())
            {
                Some(pipeline) => pipeline,
                None => {
                    warn!(bot = %bot_uuid, "no pipeline available; dropping event");
                    return;
                }
            };
            let query = Query::from_event(
                event,
                adapter,
                bot_uuid.clone(),
                pipeline.entity.uuid.clone(),
                pipeline.entity.config.clone(),
            );
            if let Err(e) = pipelines.submit(query).await {
                warn!(bot = %bot_uuid, error = %e, "query submission rejected");
            }
        })
    })
}
