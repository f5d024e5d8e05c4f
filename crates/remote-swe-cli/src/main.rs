mod console;
mod redaction;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use remote_swe_agents::mcp::McpToolProvider;
use remote_swe_agents::tools::{ReportProgressTool, ThinkTool};
use remote_swe_agents::{
    ConversationEngine, ConverseBackend, EngineParts, EngineSettings, InferenceClient,
    SessionController, ToolDispatcher,
};
use remote_swe_config::{AppConfig, ConfigLoader};
use remote_swe_db::{ContentCodec, FsBlobStore, SqliteMessageStore, TokenLedger};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::console::ConsoleHooks;
use crate::redaction::RedactingWriter;

const LOCAL_USER: &str = "local-user";

#[derive(Debug, Parser)]
#[command(name = "remote-swe", version, about = "Run the coding agent against a local conversation")]
struct Args {
    /// Config file (YAML or TOML). Defaults apply when it does not exist.
    #[arg(long, env = "REMOTE_SWE_CONFIG", default_value = "remote-swe.yml")]
    config: PathBuf,

    #[arg(long, env = "REMOTE_SWE_CONVERSATION", default_value = "local")]
    conversation: String,

    /// Filter directive used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr());
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

struct Runtime {
    engine: Arc<ConversationEngine>,
    ledger: Arc<TokenLedger>,
}

fn build_runtime(config: &AppConfig) -> anyhow::Result<Runtime> {
    let codec = Arc::new(ContentCodec::new(Arc::new(FsBlobStore::new(config.blob_dir()))));
    let store = SqliteMessageStore::open(&config.database_path(), Arc::clone(&codec))
        .context("failed to open message store")?
        .with_page_size(config.store.history_page_size);
    let ledger = Arc::new(
        TokenLedger::open(&config.database_path()).context("failed to open token ledger")?,
    );

    let backend = match &config.inference.endpoint_url {
        Some(url) => ConverseBackend::new().with_base_url(url.as_str()),
        None => ConverseBackend::new(),
    };
    let inference =
        InferenceClient::from_config(Arc::new(backend), &config.inference, |key| {
            std::env::var(key).ok()
        })?
        .with_ledger(Arc::clone(&ledger));

    let mut tools = ToolDispatcher::new()
        .with_external(Arc::new(McpToolProvider::new(config.mcp_servers.clone())));
    tools.register(Arc::new(ReportProgressTool));
    tools.register(Arc::new(ThinkTool));

    let engine = ConversationEngine::new(EngineParts {
        store: Arc::new(store),
        codec,
        inference,
        tools,
        hooks: Arc::new(ConsoleHooks),
        sessions: SessionController::new(),
        settings: EngineSettings::from_config(config)?,
    });

    Ok(Runtime {
        engine: Arc::new(engine),
        ledger,
    })
}

async fn print_usage(ledger: &TokenLedger, conversation_id: &str) -> anyhow::Result<()> {
    let entries = ledger.entries(conversation_id).await?;
    if entries.is_empty() {
        println!("no usage recorded for {conversation_id}");
    }
    for e in entries {
        println!(
            "{}: input={} output={} cache_read={} cache_write={}",
            e.model_id, e.input_tokens, e.output_tokens, e.cache_read_tokens, e.cache_write_tokens
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(&args);

    let config = ConfigLoader::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    let Runtime { engine, ledger } = build_runtime(&config)?;
    let conversation_id = args.conversation.as_str();

    info!(
        "worker ready for conversation {conversation_id} (data dir: {})",
        config.resolved_data_dir().display()
    );
    let mut last: Option<JoinHandle<()>> = Some(engine.dispatch_resume(conversation_id).await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/cancel" => {
                if !engine.sessions().cancel(conversation_id).await {
                    println!("nothing is running");
                }
            }
            "/usage" => print_usage(&ledger, conversation_id).await?,
            "/quit" => break,
            text => {
                match engine
                    .receive_user_message(conversation_id, text, Some(LOCAL_USER))
                    .await
                {
                    Ok(handle) => last = Some(handle),
                    Err(e) => warn!("failed to record message: {e}"),
                }
            }
        }
    }

    if let Some(handle) = last.take() {
        if let Err(e) = handle.await {
            warn!("conversation task ended abnormally: {e}");
        }
    }
    engine.shutdown().await;
    Ok(())
}
