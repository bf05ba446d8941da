//! CLI binary for cua.

use clap::Parser;
use cua::clarify::ClarificationBridge;
use cua::config::{AgentConfig, load_dotenv};
use cua::context::SessionContext;
use cua::inference::InferenceClient;
use cua::memory::MemoryStore;
use cua::narration::NarrationQueue;
use cua::perf::PerfTracker;
use cua::planner::{Planner, PlannerPipeline};
use cua::repl::{PrintTts, TextRepl};
use cua::session_log::SessionLog;
use cua::speculative::SpeculativeDispatcher;
use cua::stt::{CloudStt, OnDeviceStt, select_provider};
use cua::{Executor, VoiceManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// cua: voice-first computer-use agent.
#[derive(Parser)]
#[command(name = "cua", version, about)]
struct Cli {
    /// Voice mode: speak requests instead of typing them.
    #[arg(long)]
    voice: bool,

    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // `.env` values never override the real environment.
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cua=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(code) = run(cli).await {
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<(), i32> {
    let mut config = match cli.config {
        Some(ref path) => AgentConfig::from_file(path),
        None => AgentConfig::load(),
    }
    .map_err(|e| {
        eprintln!("error: {e}");
        1
    })?;
    config.apply_env();

    if config.inference.api_url.trim().is_empty() {
        eprintln!("error: no inference endpoint configured");
        return Err(1);
    }

    if let Err(e) = cua::platform::request_permissions() {
        eprintln!(
            "error: {e}\nGrant microphone, speech recognition, screen recording, \
             and accessibility access in your system settings, then run again."
        );
        return Err(1);
    }
    let collaborators = cua::platform::collaborators().map_err(|e| {
        eprintln!("error: {e}");
        1
    })?;

    let session_log = Arc::new(
        SessionLog::create(&cua::cua_dirs::logs_dir()).map_err(|e| {
            eprintln!("error: cannot create session log: {e}");
            1
        })?,
    );
    session_log.log("session started");

    cua::overlay::install(Arc::clone(&collaborators.overlay));

    let client = Arc::new(InferenceClient::new(&config.inference));
    let narration = if cli.voice {
        Arc::new(NarrationQueue::new(Arc::clone(&collaborators.tts)))
    } else {
        Arc::new(NarrationQueue::new(Arc::new(PrintTts)))
    };
    let dispatcher = Arc::new(SpeculativeDispatcher::new(config.speculation.clone()));
    let bridge = Arc::new(ClarificationBridge::new());
    let context = Arc::new(SessionContext::new());
    let perf = Arc::new(PerfTracker::new());
    let memory = Arc::new(MemoryStore::open_default().map_err(|e| {
        eprintln!("error: cannot open memory store: {e}");
        1
    })?);

    let executor = Arc::new(Executor::new(
        Arc::clone(&client),
        Arc::clone(&collaborators.screen),
        Arc::clone(&collaborators.sink),
        Arc::clone(&narration),
        config.executor.clone(),
        config.inference.clone(),
    ));
    let planner = Arc::new(Planner::new(Arc::clone(&client), config.inference.clone()));
    let pipeline = Arc::new(PlannerPipeline::new(
        planner,
        Arc::clone(&executor),
        Arc::clone(&collaborators.screen),
        Arc::clone(&narration),
        Arc::clone(&bridge),
        config.executor.clone(),
        config.planner.clone(),
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, shutting down...");
                shutdown.cancel();
            }
        });
    }

    if cli.voice {
        let stt = select_provider(
            &config.stt,
            Box::new(OnDeviceStt::new(
                Arc::clone(&collaborators.speech_engine),
                config.stt.clone(),
            )),
            Box::new(CloudStt::new(
                Arc::clone(&collaborators.recognizer),
                config.stt.clone(),
            )),
        )
        .await;

        println!("cua v{} voice mode. Say \"quit\" to exit.", env!("CARGO_PKG_VERSION"));
        let mut manager = VoiceManager::new(
            stt,
            narration,
            dispatcher,
            bridge,
            executor,
            pipeline,
            client,
            Arc::clone(&collaborators.screen),
            context,
            memory,
            perf,
            Arc::clone(&session_log),
            config,
            shutdown,
        );
        if let Err(e) = manager.run().await {
            eprintln!("error: {e}");
            session_log.log(&format!("fatal: {e}"));
            return Err(1);
        }
    } else {
        println!(
            "cua v{} text mode. Type a request, or \"quit\" to exit.",
            env!("CARGO_PKG_VERSION")
        );
        let repl = TextRepl::new(
            executor,
            pipeline,
            narration,
            Arc::clone(&collaborators.screen),
            context,
            config,
            shutdown,
        );
        if let Err(e) = repl.run().await {
            eprintln!("error: {e}");
            return Err(1);
        }
    }

    session_log.log("session ended");
    Ok(())
}
