use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chime::comm::{self, ChannelConnector, Outbound};
use chime::config::{self, Config};
use chime::engine::{self, ConversationEngine, TrimPolicy, DEFAULT_SYSTEM_PROMPT};
use chime::gcal::{CalendarClient, GoogleCalendar};
use chime::models::OpenAIProvider;
use chime::reminders::ReminderService;
use chime::scheduler::store::JobStore;
use chime::scheduler::JobRuntime;
use chime::speech::{NullSynthesizer, OpenAISpeech, OpenAITranscriber, SpeechSynthesizer, Transcriber};
use chime::telegram::{TelegramApi, TelegramBot};
use chime::tools::{self, ToolDispatcher};

#[derive(Parser, Debug)]
#[command(name = "chime", version, about = "Conversational reminder assistant")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the assistant (scheduler + Telegram transport)
    Start,
    /// Run a single conversation turn and print the delivered reply
    Send {
        /// Chat id to run the turn in
        #[arg(long, default_value_t = 0)]
        chat: i64,
        /// User message to send
        #[arg(long)]
        message: String,
    },
}

/// Connector that prints deliveries to stdout, used by `chime send`.
struct StdoutConnector;

#[async_trait::async_trait]
impl ChannelConnector for StdoutConnector {
    fn name(&self) -> &str {
        "stdout"
    }

    fn matches(&self, _chat_id: i64) -> bool {
        true
    }

    async fn deliver(&self, chat_id: i64, payload: Outbound) -> anyhow::Result<()> {
        match payload {
            Outbound::Text(text) => println!("[{chat_id}] {text}"),
            Outbound::TextWithCancel { text, job_name } => {
                println!("[{chat_id}] {text} (cancel: {job_name})")
            }
            Outbound::Voice(audio) => println!("[{chat_id}] <voice: {} bytes>", audio.len()),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| chime::chime_home().join("config.yaml"));

    info!(path = %config_path.display(), "loading configuration");
    let cfg = Config::load(&config_path).await?;
    let tz = cfg.tz()?;

    // A schema/registry mismatch is a programming error; refuse to hand
    // the model a function we cannot dispatch.
    tools::validate_registry().context("tool registry does not match the advertised schema")?;

    let data_dir = cfg.data_dir();

    // The job store is what makes reminders survive restarts — refuse to
    // start without it.
    let store = Arc::new(
        JobStore::open(&data_dir.join("jobs.db")).context("cannot open the job store")?,
    );

    let api_key = cfg.model.resolved_api_key();
    if api_key.is_empty() {
        anyhow::bail!("model api key is not configured (set OPENAI_API_KEY or model.api_key)");
    }
    let provider = Arc::new(match &cfg.model.endpoint {
        Some(endpoint) => {
            OpenAIProvider::with_config(api_key.clone(), endpoint.clone(), cfg.model.model.clone())
        }
        None => OpenAIProvider::new(api_key.clone(), cfg.model.model.clone()),
    });

    let speech: Arc<dyn SpeechSynthesizer> = if cfg.speech.tts {
        Arc::new(OpenAISpeech::new(
            api_key.clone(),
            cfg.speech.model.clone(),
            cfg.speech.voice.clone(),
        ))
    } else {
        Arc::new(NullSynthesizer)
    };

    let calendar: Option<Arc<dyn CalendarClient>> = cfg.calendar.as_ref().map(|c| {
        Arc::new(GoogleCalendar::new(
            config::resolve_secret(&c.api_key),
            c.calendar_id.clone(),
            tz,
        )) as Arc<dyn CalendarClient>
    });

    let system_prompt = load_system_prompt(&cfg).await;

    // Restore persisted jobs before any could be due.
    let runtime = JobRuntime::start(store.clone(), tz).await?;
    let restored = runtime.restore().await?;
    info!(restored, "persisted jobs reloaded");

    let reminders = ReminderService::new(runtime.clone(), store.clone());
    let dispatcher = ToolDispatcher::new(reminders.clone(), calendar.clone(), provider.clone());

    let engine = ConversationEngine::new(
        provider,
        dispatcher,
        speech,
        system_prompt,
        data_dir.join("history"),
        TrimPolicy {
            token_threshold: cfg.history.token_threshold,
            trim_fraction: cfg.history.trim_fraction,
        },
    );

    let cancel = CancellationToken::new();
    let _dispatcher_task = engine::spawn_dispatcher(engine.clone(), cancel.clone());

    if let Some(Command::Send { chat, message }) = cli.command {
        comm::register_connector(Arc::new(StdoutConnector)).await;
        engine.send(chat, &message).await?;
        runtime.shutdown().await;
        return Ok(());
    }

    match &cfg.telegram {
        Some(tg) => {
            let token = config::resolve_secret(&tg.token);
            if token.is_empty() {
                warn!("telegram token resolves empty — transport disabled");
            } else {
                let transcriber: Option<Arc<dyn Transcriber>> =
                    Some(Arc::new(OpenAITranscriber::new(api_key.clone())));
                let bot = TelegramBot::new(
                    TelegramApi::new(&token),
                    engine.clone(),
                    reminders.clone(),
                    calendar.clone(),
                    transcriber,
                    tg.allowed_users.clone(),
                );
                bot.spawn(cancel.clone()).await?;
                info!("telegram transport started");
            }
        }
        None => info!("no telegram transport configured"),
    }

    info!("chime ready");

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down");

    cancel.cancel();
    runtime.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

/// Load the system prompt: configured file, else the built-in default.
async fn load_system_prompt(cfg: &Config) -> String {
    let Some(path) = &cfg.system_prompt_path else {
        return DEFAULT_SYSTEM_PROMPT.to_string();
    };
    let mut full = PathBuf::from(path);
    if full.is_relative() {
        full = chime::chime_home().join(full);
    }
    match tokio::fs::read_to_string(&full).await {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %full.display(), error = %e,
                  "system prompt file unreadable, using built-in default");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}
