use anyhow::Context;
use chatloom::config::Config;
use chatloom::llm::registry::ProviderSet;
use chatloom::llm::stream::{StreamCallback, StreamChunk, ToolPhase};
use chatloom::llm::{ChatCompletionOptions, Message};
use chatloom::pipeline::{ChatPipeline, ChatPipelineInput};
use chatloom::tools::default_registry;
use chatloom::tools::notes::{MemoryNoteStore, Note};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatloom")]
#[command(about = "Chat with your notes through any configured LLM provider.")]
struct Cli {
    /// Config file to use instead of ~/.chatloom/config.toml
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive chat
    Chat {
        /// Model to use, optionally prefixed with a provider (e.g. `openai:gpt-4o`)
        #[arg(short, long)]
        model: Option<String>,
        /// Wait for complete replies instead of streaming
        #[arg(long)]
        no_stream: bool,
        /// Do not offer tools to the model
        #[arg(long)]
        no_tools: bool,
    },
    /// List available tools
    Tools,
    /// Show configured providers and whether they can be used
    Providers,
    /// Show configuration
    Config,
}

fn demo_store() -> MemoryNoteStore {
    MemoryNoteStore::with_notes(vec![
        Note::new("root-projects", "Projects", "Active and archived projects."),
        Note::new(
            "garden",
            "Garden plan",
            "Tomatoes along the south fence. Basil between rows. Water every other morning.",
        )
        .with_parent("root-projects")
        .with_attribute("label", "outdoor"),
        Note::new(
            "reading",
            "Reading list",
            "Designing Data-Intensive Applications; The Rust Programming Language.",
        )
        .with_attribute("label", "books"),
        Note::new(
            "meeting-0412",
            "Meeting notes 12 April",
            "Agreed to ship the sync feature after the storage migration.",
        )
        .with_parent("root-projects"),
    ])
}

fn load_config(path: Option<&std::path::Path>) -> Config {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn print_chunk(chunk: &StreamChunk) {
    if let Some(info) = &chunk.tool_execution {
        let line = match info.phase {
            ToolPhase::Start => format!("[tool] {} ...", info.tool.name),
            ToolPhase::Update => format!("[tool] {} running", info.tool.name),
            ToolPhase::Complete => format!("[tool] {} done", info.tool.name),
            ToolPhase::Error => format!(
                "[tool] {} failed: {}",
                info.tool.name,
                info.error.as_deref().unwrap_or("unknown error")
            ),
        };
        eprintln!("{}", line.dimmed());
        return;
    }
    if !chunk.text.is_empty() {
        eprint!("{}", chunk.text);
        let _ = std::io::stderr().flush();
    }
}

fn run_chat(cfg: Config, model: Option<String>, stream: bool, tools: bool) -> anyhow::Result<()> {
    let providers = Arc::new(ProviderSet::from_config(&cfg));
    let registry = Arc::new(default_registry(Arc::new(demo_store())));
    let pipeline = ChatPipeline::new(cfg.pipeline.clone(), providers, registry);
    let session_id = uuid::Uuid::new_v4().to_string();

    println!("{}", format!("chatloom v{}", env!("CARGO_PKG_VERSION")).bold());
    println!(
        "Provider: {}",
        model
            .as_deref()
            .unwrap_or(&cfg.ai.selected_provider)
            .green()
    );
    println!("Type {} to exit.\n", "Ctrl+D".dimmed());

    let mut history: Vec<Message> = Vec::new();
    let mut rl = rustyline::DefaultEditor::new().context("failed to initialize readline")?;

    loop {
        match rl.readline(&format!("{} ", "you>".blue().bold())) {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);
                history.push(Message::user(input));

                let options = ChatCompletionOptions {
                    model: model.clone(),
                    temperature: Some(cfg.ai.temperature),
                    stream: Some(stream),
                    enable_tools: Some(tools),
                    session_id: Some(session_id.clone()),
                    ..Default::default()
                };
                let callback = stream.then(|| StreamCallback::new(print_chunk));

                let start = std::time::Instant::now();
                if stream {
                    eprint!("{} ", "bot>".green().bold());
                } else {
                    eprint!("{}", "[thinking...]".dimmed());
                }
                let result = pipeline.execute(ChatPipelineInput {
                    messages: history.clone(),
                    query: Some(input.to_string()),
                    options,
                    format: None,
                    stream_callback: callback,
                });

                match result {
                    Ok(output) => {
                        if stream {
                            eprintln!();
                        } else {
                            eprint!("\r{}\r", " ".repeat(20));
                            println!("{} {}", "bot>".green().bold(), output.response.text);
                        }
                        if output.ceiling_reached {
                            println!("{}", "(tool call limit reached)".yellow());
                        }
                        history.push(Message::assistant(&output.response.text));
                    }
                    Err(e) => {
                        eprintln!();
                        eprintln!("{} {}", "Error:".red().bold(), e);
                        history.pop();
                    }
                }
                let elapsed = start.elapsed();
                println!("{}", format!("({:.1}s)", elapsed.as_secs_f64()).dimmed());
                println!();
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("Use Ctrl+D to exit.");
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {}", err);
                break;
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref());

    match cli.command {
        Commands::Chat {
            model,
            no_stream,
            no_tools,
        } => {
            let stream = cfg.pipeline.enable_streaming && !no_stream;
            run_chat(cfg, model, stream, !no_tools)?;
        }
        Commands::Tools => {
            let registry = default_registry(Arc::new(demo_store()));
            println!("{}", "Available tools:".bold());
            println!();
            for tool in registry.get_all_tools() {
                println!("  {} - {}", tool.name().cyan(), tool.description());
            }
        }
        Commands::Providers => {
            let providers = ProviderSet::from_config(&cfg);
            let selected = providers.selected_provider().unwrap_or("");
            println!("{}", "Providers:".bold());
            println!();
            for provider in providers.providers() {
                let status = if provider.is_available() {
                    "available".green()
                } else {
                    "unavailable".red()
                };
                let marker = if provider.name().eq_ignore_ascii_case(selected) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {:<10} {:<12} {}",
                    marker,
                    provider.name().cyan(),
                    status,
                    provider.default_model().unwrap_or_default().dimmed()
                );
            }
        }
        Commands::Config => {
            println!("{}", "Current configuration:".bold());
            println!();
            let text = cfg.to_toml().context("failed to serialize config")?;
            println!("{}", text);
        }
    }
    Ok(())
}
