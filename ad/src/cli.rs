//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use runledger::Schedule;

/// AgentDaemon - agent orchestration control plane
#[derive(Parser)]
#[command(
    name = "agentdaemon",
    about = "Agent orchestration and runtime control plane",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/agentdaemon/logs/agentdaemon.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Manage agent definitions
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Trigger an immediate run of an agent
    Trigger {
        /// Agent name
        name: String,

        /// Report poll progress while waiting for the outcome
        #[arg(short, long)]
        wait: bool,
    },

    /// Show execution records for an agent
    Logs {
        /// Agent name
        name: String,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Records to skip
        #[arg(short, long, default_value = "0")]
        offset: u32,

        /// Filter by status (running, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Aggregated cost report grouped by agent
    Report {
        /// Reporting window (day, week, month, all)
        #[arg(short, long, default_value = "day")]
        period: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stream live metrics snapshots to the terminal
    Watch {
        /// Stop after this many snapshots (0 = until interrupted)
        #[arg(long, default_value = "0")]
        count: u32,
    },

    /// Internal: Run as daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,
}

/// Daemon process management
#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the background
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,
}

/// Agent definition management
#[derive(Subcommand)]
pub enum AgentCommand {
    /// List all agents with their derived runtime state
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Create a new agent
    Create {
        /// Unique agent name
        name: String,

        /// Provider name (must be configured)
        #[arg(long, default_value = "anthropic")]
        provider: String,

        /// Model identifier
        #[arg(long)]
        model: String,

        /// Behavior prompt
        #[arg(long, default_value = "")]
        prompt: String,

        /// Schedule: "manual", "interval:HOURS", or "cron:EXPR"
        #[arg(long, default_value = "manual")]
        schedule: String,

        /// Rolling-hour admission limit
        #[arg(long, default_value = "10")]
        rate_limit: u32,

        /// Daily cost cap in USD
        #[arg(long, default_value = "5.0")]
        cost_limit: f64,

        /// Sampling temperature
        #[arg(long, default_value = "0.7")]
        temperature: f64,

        /// Maximum output tokens per call
        #[arg(long, default_value = "4096")]
        max_tokens: u32,
    },

    /// Update fields of an existing agent
    Update {
        /// Agent name
        name: String,

        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        prompt: Option<String>,

        /// Schedule: "manual", "interval:HOURS", or "cron:EXPR"
        #[arg(long)]
        schedule: Option<String>,

        #[arg(long)]
        rate_limit: Option<u32>,

        #[arg(long)]
        cost_limit: Option<f64>,

        #[arg(long)]
        temperature: Option<f64>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Delete an agent (restricted while execution records reference it)
    Delete {
        /// Agent name
        name: String,
    },

    /// Enable an agent
    Enable { name: String },

    /// Disable an agent (rejected on every admission path)
    Disable { name: String },

    /// Pause an agent (scheduler skips it, manual triggers still work)
    Pause { name: String },

    /// Resume a paused agent
    Resume { name: String },
}

/// Output format for list/logs/report commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            _ => Err(format!("Unknown format: {}. Use: text, json, or table", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Parse the CLI schedule shorthand into the tagged schedule type
pub fn parse_schedule(s: &str) -> Result<Schedule, String> {
    if s == "manual" {
        return Ok(Schedule::Manual);
    }
    if let Some(hours) = s.strip_prefix("interval:") {
        let hours: f64 = hours
            .parse()
            .map_err(|_| format!("Invalid interval hours: '{}'", hours))?;
        return Ok(Schedule::Interval { hours });
    }
    if let Some(expression) = s.strip_prefix("cron:") {
        return Ok(Schedule::Cron {
            expression: expression.to_string(),
        });
    }
    Err(format!(
        "Unknown schedule: '{}'. Use: manual, interval:HOURS, or cron:EXPR",
        s
    ))
}
