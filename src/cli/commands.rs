use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wsrpc")]
#[command(about = "A reconnecting JSON-RPC client over WebSocket")]
#[command(version)]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Server URL, overrides the configured one (e.g. ws://127.0.0.1:2022)
    #[arg(short, long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a query and print its result
    ///
    /// Input is parsed as JSON; anything that is not valid JSON is sent as a string.
    ///
    /// Examples:
    ///   wsrpc query greeting
    ///   wsrpc query greeting --input '"alice"'
    Query {
        /// Procedure path
        path: String,
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Run a mutation and print its result
    ///
    /// Example: wsrpc mutation posts.add --input '{"title": "hi"}'
    Mutation {
        /// Procedure path
        path: String,
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Subscribe and print events until interrupted
    ///
    /// Survives reconnects: the subscription is re-issued on every new connection.
    ///
    /// Examples:
    ///   wsrpc subscribe onMessage
    ///   wsrpc subscribe onMessage --count 10
    Subscribe {
        /// Procedure path
        path: String,
        #[arg(short, long)]
        input: Option<String>,
        /// Stop after this many data events
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the configuration file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
