//! AgentDaemon - agent orchestration control plane
//!
//! CLI entry point for managing agents and the scheduling daemon.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use agentdaemon::cli::{AgentCommand, Cli, Command, DaemonCommand, OutputFormat, parse_schedule};
use agentdaemon::config::Config;
use agentdaemon::control::{AgentPatch, AgentView, Caller, ControlPlane, ReportPeriod};
use agentdaemon::daemon::DaemonManager;
use agentdaemon::executor::RunExecutor;
use agentdaemon::provider::ProviderRegistry;
use agentdaemon::scheduler::Scheduler;
use agentdaemon::state::StateManager;
use agentdaemon::telemetry::{MetricsBroadcaster, MetricsSnapshot};
use agentdaemon::trigger::{TriggerGateway, TriggerOutcome, TriggerResponse};
use runledger::{AgentDef, CostReportRow, ExecutionRecord, ExecutionStatus, now_ms};

fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdaemon")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(log_dir.join("agentdaemon.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Daemon { command } => match command {
            DaemonCommand::Start { foreground } => cmd_daemon_start(&config, foreground).await,
            DaemonCommand::Stop => cmd_daemon_stop(),
            DaemonCommand::Status => cmd_daemon_status(),
        },
        Command::RunDaemon => run_daemon(&config).await,
        Command::Agent { command } => cmd_agent(&config, command).await,
        Command::Trigger { name, wait } => cmd_trigger(&config, &name, wait).await,
        Command::Logs {
            name,
            limit,
            offset,
            status,
            format,
        } => cmd_logs(&config, &name, limit, offset, status, format).await,
        Command::Report { period, format } => cmd_report(&config, &period, format).await,
        Command::Watch { count } => cmd_watch(&config, count).await,
    }
}

/// The caller identity for local CLI invocations
///
/// Local shell access is the operator capability; remote transports attach
/// their own authentication in front of the same control plane.
fn local_operator() -> Caller {
    Caller::operator(std::env::var("USER").unwrap_or_else(|_| "operator".to_string()))
}

/// Build the provider registry, optionally tolerating missing API keys
///
/// Read-only commands (list, logs, report) work without provider
/// credentials; trigger and the daemon itself require them.
fn build_registry(config: &Config, strict: bool) -> Result<ProviderRegistry> {
    match ProviderRegistry::from_config(config) {
        Ok(registry) => Ok(registry),
        Err(e) if !strict => {
            warn!(error = %e, "Providers unavailable, continuing without them");
            Ok(ProviderRegistry::default().with_fallback(config.fallback_provider.clone()))
        }
        Err(e) => Err(eyre::eyre!("Failed to build providers: {}", e)),
    }
}

/// Wire the control plane over the shared ledger
fn build_control_plane(config: &Config, registry: ProviderRegistry) -> Result<(ControlPlane, MetricsBroadcaster)> {
    let state = StateManager::spawn(&config.storage.ledger_path)?;
    let executor = RunExecutor::new(state.clone(), config.executor.clone());
    let trigger = TriggerGateway::new(
        state.clone(),
        executor,
        registry,
        config.scheduler.clone(),
        config.trigger.clone(),
    );
    let telemetry = MetricsBroadcaster::new(state.clone(), config.telemetry.clone());
    Ok((ControlPlane::new(state, trigger, telemetry.clone()), telemetry))
}

// === Daemon commands ===

async fn cmd_daemon_start(config: &Config, foreground: bool) -> Result<()> {
    if foreground {
        return run_daemon(config).await;
    }
    let manager = DaemonManager::new();
    let pid = manager.start()?;
    println!("Daemon started (pid {})", pid);
    Ok(())
}

fn cmd_daemon_stop() -> Result<()> {
    DaemonManager::new().stop()?;
    println!("Daemon stopped");
    Ok(())
}

fn cmd_daemon_status() -> Result<()> {
    let status = DaemonManager::new().status();
    if status.running {
        println!("Daemon running (pid {})", status.pid.unwrap_or_default());
    } else {
        println!("Daemon not running");
    }
    println!("PID file: {}", status.pid_file.display());
    Ok(())
}

/// The daemon process: scheduler + telemetry over the shared ledger
async fn run_daemon(config: &Config) -> Result<()> {
    config.validate()?;

    let manager = DaemonManager::new();
    manager.register_self()?;

    let state = StateManager::spawn(&config.storage.ledger_path)?;

    // Records left running by a previous process violate the single-flight
    // invariant; fail them before scheduling anything
    let swept = state
        .sweep_orphans("daemon restarted during execution", now_ms())
        .await
        .map_err(|e| eyre::eyre!("Recovery sweep failed: {}", e))?;
    if swept > 0 {
        warn!(swept, "Failed executions left running by a previous process");
    }

    let registry = build_registry(config, true)?;
    let executor = RunExecutor::new(state.clone(), config.executor.clone());
    let scheduler = Scheduler::new(
        state.clone(),
        executor.clone(),
        registry.clone(),
        config.scheduler.clone(),
    );
    let telemetry = MetricsBroadcaster::new(state.clone(), config.telemetry.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let telemetry_task = tokio::spawn(telemetry.run(shutdown_rx));

    info!(ledger = %config.storage.ledger_path.display(), "AgentDaemon running");
    wait_for_shutdown().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    let _ = telemetry_task.await;
    let _ = state.shutdown().await;
    manager.deregister_self()?;
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// === Agent commands ===

async fn cmd_agent(config: &Config, command: AgentCommand) -> Result<()> {
    let registry = build_registry(config, false)?;
    let (plane, _telemetry) = build_control_plane(config, registry)?;
    let caller = local_operator();

    match command {
        AgentCommand::List { format } => {
            let views = plane.list_agents().await?;
            print_agents(&views, &format)?;
        }
        AgentCommand::Create {
            name,
            provider,
            model,
            prompt,
            schedule,
            rate_limit,
            cost_limit,
            temperature,
            max_tokens,
        } => {
            let schedule = parse_schedule(&schedule).map_err(|e| eyre::eyre!(e))?;
            let mut def = AgentDef::new(&name, provider, model)
                .with_schedule(schedule)
                .with_limits(rate_limit, cost_limit)
                .with_prompt(prompt);
            def.temperature = temperature;
            def.max_tokens = max_tokens;
            plane.create_agent(&caller, def).await?;
            println!("Agent '{}' created", name);
        }
        AgentCommand::Update {
            name,
            provider,
            model,
            prompt,
            schedule,
            rate_limit,
            cost_limit,
            temperature,
            max_tokens,
        } => {
            let schedule = match schedule {
                Some(s) => Some(parse_schedule(&s).map_err(|e| eyre::eyre!(e))?),
                None => None,
            };
            let patch = AgentPatch {
                provider,
                model,
                temperature,
                max_tokens,
                prompt,
                rate_limit_per_hour: rate_limit,
                cost_limit_daily: cost_limit,
                schedule,
            };
            let view = plane.update_agent(&caller, &name, patch).await?;
            println!("Agent '{}' updated (state: {})", name, view.state);
        }
        AgentCommand::Delete { name } => {
            plane.delete_agent(&caller, &name).await?;
            println!("Agent '{}' deleted", name);
        }
        AgentCommand::Enable { name } => {
            plane.set_enabled(&caller, &name, true).await?;
            println!("Agent '{}' enabled", name);
        }
        AgentCommand::Disable { name } => {
            plane.set_enabled(&caller, &name, false).await?;
            println!("Agent '{}' disabled", name);
        }
        AgentCommand::Pause { name } => {
            plane.pause(&caller, &name).await?;
            println!("Agent '{}' paused", name);
        }
        AgentCommand::Resume { name } => {
            plane.resume(&caller, &name).await?;
            println!("Agent '{}' resumed", name);
        }
    }
    Ok(())
}

// === Trigger ===

async fn cmd_trigger(config: &Config, name: &str, wait: bool) -> Result<()> {
    // A trigger actually calls the provider, so fail fast without keys
    config.validate()?;
    let registry = build_registry(config, true)?;
    let (plane, _telemetry) = build_control_plane(config, registry)?;
    let caller = local_operator();

    let execution_id = match plane.trigger(&caller, name).await? {
        TriggerResponse::Accepted { execution_id } => {
            println!("Trigger accepted (execution {})", execution_id);
            execution_id
        }
        TriggerResponse::Rejected(reason) => {
            return Err(eyre::eyre!("Trigger rejected: {}", reason));
        }
    };

    // The run executes in this process, so the outcome is always awaited;
    // --wait additionally reports the bounded poll protocol's progress
    let mut notified = false;
    loop {
        match plane.await_trigger_outcome(&execution_id).await? {
            TriggerOutcome::Completed(record) => {
                println!(
                    "Completed: {} items, {} tokens, ${:.4} ({}ms)",
                    record.items_processed, record.tokens_used, record.cost_usd, record.duration_ms
                );
                return Ok(());
            }
            TriggerOutcome::Failed(record) => {
                return Err(eyre::eyre!(
                    "Execution failed: {}",
                    record.error_message.unwrap_or_else(|| "unknown error".to_string())
                ));
            }
            TriggerOutcome::StillRunning => {
                if wait && !notified {
                    println!("Still running; check `ad logs {}` for the outcome", name);
                    notified = true;
                }
            }
        }
    }
}

// === Logs / report / watch ===

async fn cmd_logs(
    config: &Config,
    name: &str,
    limit: u32,
    offset: u32,
    status: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let registry = build_registry(config, false)?;
    let (plane, _telemetry) = build_control_plane(config, registry)?;

    let status = match status {
        Some(s) => Some(ExecutionStatus::parse(&s).map_err(|e| eyre::eyre!(e))?),
        None => None,
    };
    let (records, total) = plane.get_logs(name, limit, offset, status).await?;
    print_logs(&records, total, &format)?;
    Ok(())
}

async fn cmd_report(config: &Config, period: &str, format: OutputFormat) -> Result<()> {
    let registry = build_registry(config, false)?;
    let (plane, _telemetry) = build_control_plane(config, registry)?;

    let period: ReportPeriod = period.parse().map_err(|e: String| eyre::eyre!(e))?;
    let rows = plane.cost_report(period).await?;
    print_report(&rows, &format)?;
    Ok(())
}

async fn cmd_watch(config: &Config, count: u32) -> Result<()> {
    let registry = build_registry(config, false)?;
    let (plane, telemetry) = build_control_plane(config, registry)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broadcast_task = tokio::spawn(telemetry.run(shutdown_rx));

    let mut stream = plane.subscribe_metrics()?;
    println!("Watching metrics (Ctrl-C to stop)...");

    let mut seen = 0;
    loop {
        tokio::select! {
            snapshot = stream.recv() => {
                match snapshot {
                    Some(snapshot) => {
                        print_snapshot(&snapshot);
                        seen += 1;
                        if count > 0 && seen >= count {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = broadcast_task.await;
    Ok(())
}

// === Output helpers ===

fn fmt_ts(ts: Option<i64>) -> String {
    match ts.and_then(chrono::DateTime::from_timestamp_millis) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

fn print_agents(views: &[AgentView], format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(views)?),
        OutputFormat::Table => {
            println!(
                "{:<20} {:<10} {:<18} {:<20} {:>6} {:>10}",
                "NAME", "STATE", "SCHEDULE", "NEXT RUN", "RATE", "COST TODAY"
            );
            for view in views {
                let schedule = match view.def.schedule.param() {
                    Some(param) => format!("{}:{}", view.def.schedule.kind(), param),
                    None => view.def.schedule.kind().to_string(),
                };
                let budget = view.budget.as_ref();
                println!(
                    "{:<20} {:<10} {:<18} {:<20} {:>6} {:>10}",
                    view.def.name,
                    view.state.to_string(),
                    schedule,
                    fmt_ts(view.def.next_run_at),
                    budget.map(|b| format!("{}/{}", b.rate_count, b.rate_limit)).unwrap_or_default(),
                    budget.map(|b| format!("${:.2}", b.cost_sum)).unwrap_or_default(),
                );
            }
        }
        OutputFormat::Text => {
            if views.is_empty() {
                println!("No agents defined");
            }
            for view in views {
                println!("{} [{}] {} {}", view.def.name, view.state, view.def.provider, view.def.model);
            }
        }
    }
    Ok(())
}

fn print_logs(records: &[ExecutionRecord], total: u64, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "total": total, "records": records }))?
            );
        }
        _ => {
            println!(
                "{:<20} {:<10} {:<10} {:>8} {:>9} {:>8}  {}",
                "STARTED", "STATUS", "SOURCE", "ITEMS", "TOKENS", "COST", "ERROR"
            );
            for record in records {
                println!(
                    "{:<20} {:<10} {:<10} {:>8} {:>9} {:>8}  {}",
                    fmt_ts(Some(record.started_at)),
                    record.status.to_string(),
                    record.source,
                    record.items_processed,
                    record.tokens_used,
                    format!("${:.4}", record.cost_usd),
                    record.error_message.as_deref().unwrap_or("-"),
                );
            }
            println!("({} of {} records)", records.len(), total);
        }
    }
    Ok(())
}

fn print_report(rows: &[CostReportRow], format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        _ => {
            println!(
                "{:<20} {:>10} {:>10} {:>12} {:>10}",
                "AGENT", "RUNS", "FAILURES", "TOKENS", "COST"
            );
            for row in rows {
                println!(
                    "{:<20} {:>10} {:>10} {:>12} {:>10}",
                    row.agent,
                    row.executions,
                    row.failures,
                    row.tokens_used,
                    format!("${:.4}", row.cost_usd),
                );
            }
            let total_cost: f64 = rows.iter().map(|r| r.cost_usd).sum();
            println!("Total: ${:.4}", total_cost);
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &MetricsSnapshot) {
    println!("--- {} ---", fmt_ts(Some(snapshot.generated_at)));
    for agent in &snapshot.agents {
        println!(
            "{:<20} {:<10} runs={} items={} cost=${:.4} errors={}{}",
            agent.name,
            agent.state.to_string(),
            agent.executions_today,
            agent.items_today,
            agent.cost_today_usd,
            agent.errors_today,
            agent
                .last_error
                .as_deref()
                .map(|e| format!(" last_error={}", e))
                .unwrap_or_default(),
        );
    }
}
