//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// meshnote - ad-hoc peer mesh with shared chat and note
///
/// Discovers nearby peers over every available transport, keeps a chat
/// stream and one shared note in sync, and needs no server.
#[derive(Parser, Debug)]
#[command(name = "meshnote")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the mesh and open an interactive session
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "MESHNOTE_CONFIG")]
        config: Option<String>,

        /// Display name announced to peers
        #[arg(short, long)]
        name: Option<String>,

        /// Ask for the hub role on the direct-link transport
        #[arg(long)]
        host: bool,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
