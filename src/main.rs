use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use quill::config::{Config, DEFAULT_CONFIG_FILE};
use quill::dispatch::Registry;
use quill::logging::InvocationLogger;
use quill::routing::{PollingRouter, Strategy};
use quill::runner::StepRunner;

#[derive(Parser)]
#[command(name = "quill", version, about = "Route pipeline steps across LLM backends")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "QUILL_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a short prompt to one backend and report the outcome
    Test {
        backend: String,
        #[arg(long, default_value = "Reply with the single word: pong")]
        prompt: String,
    },
    /// List the models a backend offers
    Models { backend: String },
    /// Show which backend a step would get (advances the rotation)
    Route {
        step: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Print the current routing state
    State,
    /// Pin a step to a backend
    Pin { step: String, backend: String },
    /// Remove a step's pin
    Unpin { step: String },
    /// Switch the rotation strategy (sequential or random)
    Strategy { strategy: Strategy },
    /// Start a new shuffle cycle
    Reset,
    /// Run a step through the router, with retries and failover
    Run {
        step: String,
        /// Prompt text; read from stdin when omitted
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let registry = Arc::new(Registry::from_config(&config));

    match cli.command {
        Command::Test { backend, prompt } => {
            let adapter = registry
                .get_adapter(&backend)
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            let result = adapter.invoke(&prompt).await;
            adapter.close();
            match result {
                Ok(text) => println!("ok [{backend}]: {}", text.trim()),
                Err(e) => anyhow::bail!("{backend}: {}", e.user_message()),
            }
        }
        Command::Models { backend } => {
            let adapter = registry
                .get_adapter(&backend)
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            for model in adapter.list_models().await {
                println!("{model}");
            }
            adapter.close();
        }
        command => {
            let router = Arc::new(PollingRouter::load(config.routing_state_path()).await);
            router.sync_backends(registry.names()).await;
            run_routing(command, config, registry, router).await?;
        }
    }
    Ok(())
}

async fn run_routing(
    command: Command,
    config: Config,
    registry: Arc<Registry>,
    router: Arc<PollingRouter>,
) -> anyhow::Result<()> {
    match command {
        Command::Route { step, count } => {
            for _ in 0..count {
                match router.resolve_backend(&step).await {
                    Some(name) => println!("{name}"),
                    None => anyhow::bail!("no backend available for step {step}"),
                }
            }
        }
        Command::State => {
            let state = router.snapshot().await;
            println!("{}", state.to_json()?);
        }
        Command::Pin { step, backend } => {
            if registry.get(&backend).is_none() {
                let suggestions = registry.suggest(&backend);
                if suggestions.is_empty() {
                    anyhow::bail!("unknown backend: {backend}");
                }
                anyhow::bail!(
                    "unknown backend: {backend}. Did you mean: {}?",
                    suggestions.join(", ")
                );
            }
            router.set_override(&step, Some(&backend)).await;
            println!("{step} -> {backend}");
        }
        Command::Unpin { step } => {
            router.set_override(&step, None).await;
            println!("{step} -> rotation");
        }
        Command::Strategy { strategy } => {
            router.set_strategy(strategy).await;
            println!("strategy: {strategy}");
        }
        Command::Reset => {
            router.reset_rotation().await;
            println!("shuffle cycle reset");
        }
        Command::Run {
            step,
            prompt,
            stream,
        } => {
            let prompt = match prompt {
                Some(p) => p,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read prompt from stdin")?;
                    buf
                }
            };

            let mut runner = StepRunner::new(registry, router, config.error_policy.clone());
            if let Some(logger) = InvocationLogger::new(config.log_dir()) {
                runner = runner.with_logger(Arc::new(logger));
            }

            if stream {
                let (backend, mut fragments) = runner.stream_step(&step, &prompt).await?;
                tracing::info!(step = %step, backend = %backend, "streaming");
                let mut stdout = std::io::stdout();
                while let Some(fragment) = fragments.next().await {
                    stdout.write_all(fragment?.as_bytes())?;
                    stdout.flush()?;
                }
                println!();
            } else {
                let outcome = runner.run_step(&step, &prompt).await?;
                tracing::info!(
                    step = %step,
                    backend = %outcome.backend,
                    attempts = outcome.attempts,
                    "step complete"
                );
                println!("{}", outcome.text);
            }
        }
        Command::Test { .. } | Command::Models { .. } => {}
    }
    Ok(())
}
