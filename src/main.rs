//! Local LLM Manager - command line entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use local_llm_manager::backend::FallbackStreamer;
use local_llm_manager::{
    ChannelSink, GenerationDispatcher, GenerationEvent, InferenceBackendAdapter, LifecycleManager,
    LoadTarget, ManagerConfig, ModelRegistry, PersistenceStore, PromptTemplate,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "local-llm")]
#[command(about = "On-device language model manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List catalog models and local artifacts
    Models,
    /// Show lifecycle state and backend capability
    Status,
    /// Download a catalog model
    Download { name: String },
    /// Load a model by name, by path, or the persisted/first local one
    Load {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        path: Option<PathBuf>,
    },
    /// Unload the persisted model and stop autoloading it
    Unload,
    /// Delete a local model artifact
    Delete { name: String },
    /// Generate a completion for a prompt
    Generate {
        prompt: String,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
        /// Skip loading the persisted model first
        #[arg(long)]
        no_autoload: bool,
    },
    /// Enable or disable loading the last model at startup
    Autoload { mode: Toggle },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let config = ManagerConfig::load(cli.config.clone())?;
    config.validate()?;

    tracing::info!(
        models_dir = ?config.models_dir,
        state_file = ?config.state_file,
        catalog = config.models.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(ModelRegistry::new(config.models.clone()));
    // No native engine is linked into this binary; embedders pass theirs here
    let backend = Arc::new(
        InferenceBackendAdapter::detect(None, config.gpu_layers)
            .with_fallback(FallbackStreamer::new(&config.fallback)),
    );
    let store = Arc::new(PersistenceStore::new(config.state_file.clone()));
    let manager = LifecycleManager::start(&config, registry, backend.clone(), store)
        .await
        .context("Failed to start lifecycle manager")?;

    match cli.command {
        Command::Models => list_models(&manager, cli.json),
        Command::Status => print(cli.json, &manager.status(), |status| {
            println!("state:        {}", status.state);
            if let Some(error) = &status.last_error {
                println!("last error:   {error}");
            }
            println!("backend path: {}", status.backend.active_path);
            println!("system info:  {}", status.backend.system_info);
            println!(
                "real inference supported: {}",
                status.backend.capability.real_inference_supported
            );
        }),
        Command::Download { name } => download(&manager, &name, cli.json).await,
        Command::Load { name, path } => {
            let target = match (name, path) {
                (_, Some(path)) => LoadTarget::Path(path),
                (Some(name), None) => LoadTarget::Named(name),
                (None, None) => LoadTarget::Auto,
            };
            let path = manager.load(target).await?;
            print(cli.json, &manager.status(), |status| {
                println!("loaded {} ({})", path.display(), status.backend.active_path);
            })
        }
        Command::Unload => {
            if let Some(result) = manager.autoload().await {
                result?;
                manager.unload().await?;
            }
            manager.set_auto_load(false).await?;
            print(cli.json, &manager.status(), |status| {
                println!("state: {} (autoload off)", status.state);
            })
        }
        Command::Delete { name } => {
            manager.delete(&name).await?;
            print(cli.json, &manager.status(), |status| {
                println!("deleted {name}, state: {}", status.state);
            })
        }
        Command::Generate {
            prompt,
            max_tokens,
            temperature,
            no_autoload,
        } => {
            if !no_autoload && let Some(Err(e)) = manager.autoload().await {
                tracing::warn!(error = %e, "Autoload failed, continuing with fallback responder");
            }
            let dispatcher = Arc::new(GenerationDispatcher::new(
                backend,
                manager.state_machine(),
                PromptTemplate::new(config.system_prompt.clone()),
            ));
            generate(
                &dispatcher,
                &prompt,
                max_tokens.unwrap_or(config.default_max_tokens),
                temperature.unwrap_or(config.default_temperature),
                cli.json,
            )
            .await
        }
        Command::Autoload { mode } => {
            let enabled = matches!(mode, Toggle::On);
            manager.set_auto_load(enabled).await?;
            print(cli.json, &serde_json::json!({ "auto_load_model": enabled }), |_| {
                println!("autoload {}", if enabled { "on" } else { "off" });
            })
        }
    }
}

fn print<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

#[derive(Serialize)]
struct ModelRow {
    name: String,
    display_name: String,
    size_bytes: u64,
    downloaded: bool,
}

fn list_models(manager: &LifecycleManager, json: bool) -> Result<()> {
    let local = manager.list_local();
    let mut rows: Vec<ModelRow> = manager
        .registry()
        .list()
        .iter()
        .map(|m| ModelRow {
            name: m.name.clone(),
            display_name: m.display_name.clone(),
            size_bytes: m.size_bytes,
            downloaded: local.iter().any(|a| a.name == m.name),
        })
        .collect();
    // Local artifacts that are not in the catalog
    for artifact in &local {
        if !manager.registry().contains(&artifact.name) {
            rows.push(ModelRow {
                name: artifact.name.clone(),
                display_name: artifact.name.clone(),
                size_bytes: artifact.size_bytes,
                downloaded: true,
            });
        }
    }

    print(json, &rows, |rows| {
        for row in rows {
            let marker = if row.downloaded { "*" } else { " " };
            println!(
                "{marker} {:<45} {:>8.1} MB  {}",
                row.name,
                row.size_bytes as f64 / 1_000_000.0,
                row.display_name
            );
        }
    })
}

async fn download(manager: &LifecycleManager, name: &str, json: bool) -> Result<()> {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(percent) = progress_rx.recv().await {
            if json {
                continue;
            }
            if percent < 0 {
                eprint!("\rdownloading...");
            } else {
                eprint!("\rdownloading {percent:>3}%");
            }
            let _ = std::io::stderr().flush();
        }
    });

    let download = manager.download(name, Some(progress_tx));
    tokio::pin!(download);
    let result = tokio::select! {
        result = &mut download => result,
        _ = shutdown_signal() => {
            manager.cancel_download();
            download.await
        }
    };
    let _ = printer.await;
    if !json {
        eprintln!();
    }

    let path = result?;
    print(json, &serde_json::json!({ "path": path }), |_| {
        println!("downloaded {}", path.display());
    })
}

async fn generate(
    dispatcher: &Arc<GenerationDispatcher>,
    prompt: &str,
    max_tokens: u32,
    temperature: f32,
    json: bool,
) -> Result<()> {
    let (sink, mut events) = ChannelSink::channel();
    let session = dispatcher.generate(prompt, max_tokens, temperature, Arc::new(sink))?;
    let path = dispatcher.status().active_path;

    let mut stop = std::pin::pin!(shutdown_signal());
    let mut stopping = false;
    let text = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(GenerationEvent::Token(token)) => {
                    if !json {
                        print!("{token}");
                        let _ = std::io::stdout().flush();
                    }
                }
                Some(GenerationEvent::Complete(text)) => break text,
                Some(GenerationEvent::Error(e)) => return Err(e.into()),
                None => anyhow::bail!("generation ended without a result"),
            },
            _ = &mut stop, if !stopping => {
                stopping = true;
                dispatcher.stop();
            }
        }
    };

    print(
        json,
        &serde_json::json!({ "session": session, "path": path, "text": text }),
        |_| println!(),
    )
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C signal");
}
