//! Clap derive structures for the `etx-bridge` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// etx-bridge -- UDP sensor gateway for MQTT
#[derive(Debug, Parser)]
#[command(
    name = "etx-bridge",
    version,
    about = "Bridge UDP sensor frames onto an MQTT broker",
    long_about = "Receives binary sensor frames over UDP, republishes them to MQTT\n\
        as raw batches and optional parsed JSON, keeps a live device directory,\n\
        and relays configuration commands from MQTT to devices over TCP.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config dir)
    #[arg(long, env = "ETX_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// MQTT broker host (overrides config)
    #[arg(long, short = 'b', env = "ETX_BRIDGE_BROKER", global = true)]
    pub broker: Option<String>,

    /// MQTT broker port (overrides config)
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    /// UDP listen port for sensor frames (overrides config)
    #[arg(long, global = true)]
    pub udp_port: Option<u16>,

    /// Agent identity on registry and result topics (overrides config)
    #[arg(long, env = "ETX_BRIDGE_AGENT_ID", global = true)]
    pub agent_id: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge until interrupted
    Run(RunArgs),

    /// Decode one hex-encoded sensor frame
    Decode(DecodeArgs),

    /// Inspect and manage the configuration file
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Publish to an in-process broker stand-in instead of MQTT
    #[arg(long)]
    pub dry_run: bool,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration: Option<u64>,
}

// ── Decode ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// Frame bytes as hex (whitespace and `0x` prefixes allowed)
    pub hex: String,

    /// Only print the device id and timestamp from the header
    #[arg(long)]
    pub metadata: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "json")]
    pub output: OutputFormat,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration (secrets redacted)
    Show,

    /// Print the config file path
    Path,

    /// Write a config file populated with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
