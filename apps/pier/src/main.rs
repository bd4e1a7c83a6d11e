use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use pier_client_core::reducer::Role;
use pier_client_core::session::{ChatObserver, ChatSnapshot, InMemoryStore};
use pier_client_core::telemetry::logging::{self, LogConfig, LogLevel};
use pier_client_core::terminal::TerminalEvent;
use pier_client_core::{AgentConnection, ClientConfig};
use pier_proto::SpawnParams;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "pier", about = "Talk to a coding agent over JSON-RPC")]
struct Cli {
    /// ws://, wss://, tcp:// or bare host:port (WebSocket).
    #[arg(long, short = 'e', env = "PIER_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and stream one prompt's reply.
    Prompt {
        #[arg(long, default_value = ".")]
        cwd: String,
        /// Resume this session instead of creating one.
        #[arg(long)]
        session: Option<String>,
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// List the agent's sessions.
    Sessions,
    /// Open a remote shell (or attach a tmux session) and pipe stdin to it.
    Terminal {
        #[arg(long)]
        tmux: Option<String>,
    },
}

/// Prints assistant text as it streams in.
#[derive(Default)]
struct StdoutPrinter {
    printed: Mutex<(Option<String>, usize)>,
}

impl ChatObserver for StdoutPrinter {
    fn chat_changed(&self, snapshot: &ChatSnapshot) {
        let Some(message) = snapshot
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant)
        else {
            return;
        };
        let mut printed = self.printed.lock();
        if printed.0.as_deref() != Some(message.id.as_str()) {
            *printed = (Some(message.id.clone()), 0);
        }
        if let Some(fresh) = message.content.get(printed.1..) {
            if !fresh.is_empty() {
                print!("{fresh}");
                let _ = std::io::stdout().flush();
                printed.1 = message.content.len();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = ClientConfig::from_env(cli.endpoint.as_deref())?;
    let connection = AgentConnection::new(config, Arc::new(InMemoryStore::new()));
    connection.rpc().connect()?;
    connection
        .rpc()
        .wait_connected()
        .await
        .with_context(|| format!("connecting to {}", connection.rpc().config().endpoint))?;

    let outcome = run(&connection, cli.command).await;
    connection.shutdown();
    outcome
}

async fn run(connection: &AgentConnection, command: Command) -> Result<()> {
    match command {
        Command::Prompt { cwd, session, text } => {
            let chat = connection.chat();
            chat.initialize().await?;
            match session {
                Some(session_id) => chat.resume_session(&session_id).await?,
                None => {
                    let session_id = chat.new_session(&cwd).await?;
                    eprintln!("session {session_id}");
                }
            }
            chat.set_observer(Arc::new(StdoutPrinter::default()));
            let reason = chat.send_prompt(&text.join(" ")).await?;
            println!();
            eprintln!("[stop: {reason}]");
        }
        Command::Sessions => {
            for session in connection.chat().list_sessions().await? {
                println!(
                    "{}\t{}",
                    session.session_id,
                    session.title.as_deref().unwrap_or("")
                );
            }
        }
        Command::Terminal { tmux } => {
            let terminals = connection.terminals();
            let (cols, rows) = (Some(120), Some(32));
            let descriptor = match tmux {
                Some(name) => terminals.connect_tmux(&name, cols, rows).await?,
                None => {
                    terminals
                        .spawn(SpawnParams {
                            cols,
                            rows,
                            ..SpawnParams::default()
                        })
                        .await?
                }
            };
            eprintln!("terminal {} ({})", descriptor.id, descriptor.name);
            let mut output = terminals.subscribe(&descriptor.id);
            let mut stdin = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    event = output.recv() => match event {
                        Some(TerminalEvent::Output(data)) => {
                            print!("{data}");
                            let _ = std::io::stdout().flush();
                        }
                        Some(TerminalEvent::Exit(code)) => {
                            eprintln!("[exit {code}]");
                            break;
                        }
                        None => break,
                    },
                    line = stdin.next_line() => match line? {
                        Some(line) => terminals.input(&descriptor.id, &format!("{line}\n")).await?,
                        None => {
                            terminals.close(&descriptor.id).await?;
                            break;
                        }
                    },
                }
            }
        }
    }
    Ok(())
}
