use anyhow::{Context, Result};
use chatter::audio::{list_input_devices, list_output_devices};
use chatter::realtime::ConnectionDiagnostics;
use chatter::{RealtimeOrchestrator, SessionConfig, SessionEvent};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Chatter - interruptible voice conversations with a realtime model
#[derive(Parser)]
#[command(name = "chatter", version, about)]
struct Cli {
    /// TOML session configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured model
    #[arg(long, global = true)]
    model: Option<String>,

    /// Override the configured voice
    #[arg(long, global = true)]
    voice: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input and output devices
    Devices,
    /// Check that the endpoint accepts a session
    Diagnose,
    /// Start a voice session; typed lines are sent as text, `/cancel` stops a reply
    Talk,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatter=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Devices => {
            print_devices();
            Ok(ExitCode::SUCCESS)
        }
        Command::Diagnose => {
            let config = load_config(&cli.config, cli.model, cli.voice)?;
            let report = ConnectionDiagnostics::run(&config).await;
            println!("{}", report.summary());
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Talk => {
            let config = load_config(&cli.config, cli.model, cli.voice)?;
            talk(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(
    path: &Option<PathBuf>,
    model: Option<String>,
    voice: Option<String>,
) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(model) = model {
        config = config.with_model(model);
    }
    if let Some(voice) = voice {
        config = config.with_voice(voice);
    }
    config.validate()?;
    Ok(config)
}

fn print_devices() {
    println!("Input devices:");
    for device in list_input_devices() {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{}", device.name, marker);
    }
    println!("Output devices:");
    for device in list_output_devices() {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{}", device.name, marker);
    }
}

async fn talk(config: SessionConfig) -> Result<()> {
    let orchestrator = RealtimeOrchestrator::with_default_devices(&config);
    orchestrator.start(config).await?;
    info!("Session started, speak or type a message (Ctrl-C to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line() => {
                match line? {
                    Some(line) => handle_line(&orchestrator, line.trim()).await,
                    None => break,
                }
            }
            _ = ticker.tick() => {
                while let Some(event) = orchestrator.try_recv_event() {
                    print_event(event);
                }
                if !orchestrator.is_running().await {
                    break;
                }
            }
        }
    }

    orchestrator.stop().await;
    while let Some(event) = orchestrator.try_recv_event() {
        print_event(event);
    }
    Ok(())
}

async fn handle_line(orchestrator: &RealtimeOrchestrator, line: &str) {
    let result = match line {
        "" => return,
        "/cancel" => orchestrator.stop_generation().await,
        text => orchestrator.send_text_message(text).await,
    };
    if let Err(e) = result {
        eprintln!("{}", e.user_message());
    }
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::Text(delta) | SessionEvent::Transcript(delta) => {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
        SessionEvent::Status(status) => eprintln!("[{}]", status),
        SessionEvent::Error(e) => eprintln!("error: {}", e.user_message()),
    }
}
