//! meshnote - ad-hoc peer mesh with shared chat and note
//!
//! Entry point for the interactive terminal runner.

use std::collections::BTreeMap;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use meshnote::cli::{Cli, Commands, ConfigSubcommand};
use meshnote::config::{self, MeshConfig};
use meshnote::error::{Error, Result};
use meshnote::logging;
use meshnote::mesh::{LogLevel, SessionCoordinator, SessionEvent, StatusSnapshot, TransportKind};
use meshnote::version;

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Run { config, name, host } => {
            run(config.as_deref(), name, host, cli.verbose, cli.quiet)
        }
    }
}

/// Load configuration, set up logging and run the session to completion
fn run(
    config_path: Option<&str>,
    name: Option<String>,
    host: bool,
    verbose: u8,
    quiet: bool,
) -> Result<()> {
    let mut config = match MeshConfig::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };
    if name.is_some() {
        config.node.name = name;
    }
    if host {
        config.node.host_preferred = true;
    }

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, verbose, quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting meshnote"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .thread_name("meshnote")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(run_session(config))
}

/// Interactive session loop
async fn run_session(config: MeshConfig) -> Result<()> {
    let name = config.display_name();
    let coordinator = SessionCoordinator::from_config(&config);
    let mut events = coordinator.subscribe();

    let identity = match coordinator.start(&name, config.node.host_preferred).await {
        Ok(identity) => identity,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    println!("Joined mesh as {}", identity);
    println!("Type to chat. Commands: /note <text>, /status, /peers, /quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut peers: BTreeMap<(TransportKind, String), String> = BTreeMap::new();

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }

            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match Input::parse(&line) {
                        Input::Quit => break,
                        Input::Empty => {}
                        Input::Status => print_status(&coordinator.status()),
                        Input::Peers => print_peers(&peers),
                        Input::Note(text) => {
                            if let Err(e) = coordinator.edit_document(&text) {
                                warn!(error = %e, "Note edit failed");
                            }
                        }
                        Input::Chat(text) => {
                            if let Err(e) = coordinator.send_chat(&text) {
                                warn!(error = %e, "Chat send failed");
                            }
                        }
                    },
                    Ok(None) => {
                        // Keep serving peers until Ctrl-C
                        debug!("stdin closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        stdin_open = false;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => render(event, &mut peers),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event display lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    coordinator.stop().await;
    info!("Session ended");
    Ok(())
}

/// One line typed by the user
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Chat(String),
    Note(String),
    Status,
    Peers,
    Quit,
    Empty,
}

impl Input {
    fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Input::Empty;
        }

        match trimmed.split_once(char::is_whitespace) {
            Some(("/note", rest)) => Input::Note(rest.trim_start().to_string()),
            _ => match trimmed {
                "/note" => Input::Note(String::new()),
                "/status" => Input::Status,
                "/peers" => Input::Peers,
                "/quit" | "/exit" => Input::Quit,
                _ => Input::Chat(trimmed.to_string()),
            },
        }
    }
}

fn render(event: SessionEvent, peers: &mut BTreeMap<(TransportKind, String), String>) {
    match event {
        SessionEvent::Chat(chat) => {
            let who = chat.name.as_deref().unwrap_or(&chat.from);
            match chat.transport {
                Some(transport) => println!("[{}] {}: {}", transport, who, chat.message),
                None => println!("[me] {}", chat.message),
            }
        }
        SessionEvent::Document(doc) => {
            println!("--- note ({}) ---", doc.timestamp);
            println!("{}", doc.text);
            println!("---");
        }
        SessionEvent::PeerConnected { transport, peer } => {
            peers.insert((transport, peer.id), peer.name);
        }
        SessionEvent::PeerDisconnected { transport, peer_id } => {
            peers.remove(&(transport, peer_id));
        }
        SessionEvent::Log {
            transport,
            level,
            message,
        } => {
            let tag = transport.map(|t| t.to_string()).unwrap_or_else(|| "session".to_string());
            match level {
                LogLevel::Warn => println!("! [{}] {}", tag, message),
                LogLevel::Info => println!("* [{}] {}", tag, message),
            }
        }
        SessionEvent::Status(status) => {
            debug!(
                connected = status.connected_total(),
                discovered = status.discovered_total(),
                "Status changed"
            );
        }
    }
}

fn print_status(status: &StatusSnapshot) {
    println!(
        "running={} advertising={} discovering={}",
        status.running, status.advertising, status.discovering
    );
    for transport in &status.transports {
        println!(
            "  {:<8} {:<20} connected={} discovered={}",
            transport.kind.to_string(),
            transport.state,
            transport.connected,
            transport.discovered
        );
    }
}

fn print_peers(peers: &BTreeMap<(TransportKind, String), String>) {
    if peers.is_empty() {
        println!("No connected peers");
        return;
    }
    for ((transport, id), name) in peers {
        println!("  [{}] {} ({})", transport, name, id);
    }
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = MeshConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let created = config::init_config(path.as_deref(), force)?;
            println!("Created configuration at {}", created.display());
        }
        ConfigSubcommand::Validate { config } => match MeshConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_parsing() {
        assert_eq!(Input::parse("  "), Input::Empty);
        assert_eq!(Input::parse("hello there"), Input::Chat("hello there".into()));
        assert_eq!(Input::parse("/note buy milk"), Input::Note("buy milk".into()));
        assert_eq!(Input::parse("/note"), Input::Note(String::new()));
        assert_eq!(Input::parse("/status"), Input::Status);
        assert_eq!(Input::parse("/peers"), Input::Peers);
        assert_eq!(Input::parse("/quit"), Input::Quit);
        assert_eq!(Input::parse("/notes"), Input::Chat("/notes".into()));
    }
}
