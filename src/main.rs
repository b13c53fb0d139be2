mod cli;

use std::io::{BufRead, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use foreman_core::{EventKind, Session, SessionEvent, TurnOutcome};
use foreman_model::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = foreman_config::load(cli.config.as_deref())?;

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::ListRoles => {
                let mut names: Vec<&String> = config.roles.keys().collect();
                names.sort();
                for name in names {
                    let role = &config.roles[name];
                    let marker = if *name == config.active_role { "*" } else { " " };
                    println!("{marker} {name:<12} {}/{}", role.provider, role.model);
                }
                return Ok(());
            }
        }
    }

    let gateway = Arc::new(Gateway::new());
    let mut session = Session::new(
        config,
        cli.role.as_deref(),
        gateway,
        cli.auto_approve,
        &cli.log_dir,
    )?;

    if let Some(log) = &cli.resume {
        if session.resume(log) {
            eprintln!("resumed context from {}", log.display());
        } else {
            eprintln!("could not resume from {}", log.display());
        }
    }

    // Ctrl-C requests an orderly cancellation of the running turn.
    let abort = session.abort_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        abort.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let (tx, rx) = mpsc::channel::<SessionEvent>(256);
    let printer = tokio::spawn(print_events(rx, cli.stream));

    session
        .initialize(&tx)
        .await
        .context("initializing tool servers")?;

    let prompt = match cli.prompt_text() {
        Some(p) => p,
        None => read_stdin_prompt()?,
    };

    let mut input = prompt;
    loop {
        let outcome = session.process_user_input(&input, &tx).await?;
        match outcome {
            TurnOutcome::Completed => break,
            TurnOutcome::Suspended => {
                // The question was already printed by the event printer.
                input = prompt_user_answer()?;
            }
        }
    }

    session.shutdown().await;
    drop(tx);
    let _ = printer.await;
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Render the event stream for a terminal consumer.
async fn print_events(mut rx: mpsc::Receiver<SessionEvent>, show_stream: bool) {
    while let Some(ev) = rx.recv().await {
        match ev.kind {
            EventKind::Status => eprintln!("[status] {}", ev.content),
            EventKind::Log => eprintln!("[log] {}", ev.content),
            EventKind::Error => eprintln!("[error] {}", ev.content),
            EventKind::Text => println!("{}", ev.content),
            EventKind::Reasoning => {
                let role = ev.meta_str("role").unwrap_or("agent");
                eprintln!("[{role}] {}", ev.content);
            }
            EventKind::Streaming => {
                if show_stream {
                    print!("{}", ev.content);
                    let _ = std::io::stdout().flush();
                }
            }
            EventKind::ToolCall => eprintln!("[tool] {}", ev.content),
            EventKind::ToolResult => {
                // The preview is already capped; full output lives in the log.
                eprintln!("[tool] {}", ev.content);
            }
            EventKind::Question => {
                let options = ev
                    .metadata
                    .get("options")
                    .and_then(|o| o.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(" / ")
                    })
                    .unwrap_or_default();
                println!();
                println!("QUESTION: {}", ev.content);
                if !options.is_empty() {
                    println!("  options: {options}");
                }
            }
            EventKind::Stats => {}
            EventKind::TodoAdd => eprintln!("[todo] + {}", ev.content),
            EventKind::TodoUpdate => {
                if let Some(status) = ev.meta_str("status") {
                    let id = ev.meta_str("id").unwrap_or("?");
                    eprintln!("[todo] {id} -> {status}");
                }
            }
        }
    }
}

fn read_stdin_prompt() -> anyhow::Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .lock()
        .read_to_string(&mut buf)
        .context("reading prompt from stdin")?;
    let prompt = buf.trim().to_string();
    anyhow::ensure!(!prompt.is_empty(), "empty prompt: pass one as an argument or on stdin");
    Ok(prompt)
}

fn prompt_user_answer() -> anyhow::Result<String> {
    print!("> ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading answer")?;
    Ok(answer.trim().to_string())
}
