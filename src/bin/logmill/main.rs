// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logmill::BoxError;
use logmill::init::agent::Agent;
use logmill::init::args::{AgentRun, CheckArgs};
use logmill::init::wait::{self, TaskSet};
use logmill::metrics::MetricStore;
use logmill::program::{ProgramRegistry, RuleCompiler};

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run agent
    Start(Box<AgentRun>),

    /// Compile every program in a directory and report errors
    Check(CheckArgs),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logmill")]
#[command(bin_name = "logmill")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGMILL_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version());
        }
        Some(Commands::Check(args)) => {
            let _guard = match setup_logging(&opt.log_format, true) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            return run_check(&args.progs);
        }
        Some(Commands::Start(agent)) => {
            // Metrics go to stdout in one-shot mode, so keep logs off it.
            let _guard = match setup_logging(&opt.log_format, agent.one_shot) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            let result = if agent.one_shot {
                run_one_shot(&agent)
            } else {
                run_agent(agent)
            };
            if let Err(e) = result {
                error!(error = %e, "Failed to run agent.");
                return ExitCode::from(1);
            }
        }
        None => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

fn run_check(dir: &Path) -> ExitCode {
    let registry = ProgramRegistry::new(Arc::new(RuleCompiler::new()), Arc::new(MetricStore::new()));
    let report = match registry.load_directory(dir) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    for name in &report.loaded {
        println!("ok      {}", name);
    }
    for (path, e) in &report.failed {
        println!("FAILED  {}: {}", path.display(), e);
    }

    if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn run_one_shot(args: &AgentRun) -> Result<(), BoxError> {
    let config = args.build_config();
    config.validate()?;

    let agent = Agent::new(config);
    let snapshot = agent.run_one_shot()?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[tokio::main]
async fn run_agent(args: Box<AgentRun>) -> Result<(), BoxError> {
    let agent = Agent::new(args.build_config());
    let registry = agent.registry();
    let progs = args.progs.clone();

    let mut agent_join_set = TaskSet::new();
    let cancel_token = CancellationToken::new();
    {
        let token = cancel_token.clone();
        agent_join_set.spawn(async move { agent.run(token).await });
    }

    let mut signals = Signals::new()?;
    loop {
        select! {
            signal = signals.next() => {
                if signal == AgentSignal::Shutdown {
                    info!("Shutdown signal received.");
                    cancel_token.cancel();
                    break;
                }

                reload_programs(&registry, progs.as_deref());
            },
            e = wait::wait_for_any_task(&mut agent_join_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of agent."),
                    Err(e) => return Err(e),
                }
                break;
            },
        }
    }

    // The agent bounds each of its own shutdown steps; this is a backstop.
    wait::wait_for_tasks_with_timeout(&mut agent_join_set, Duration::from_secs(10)).await?;

    Ok(())
}

fn reload_programs(registry: &ProgramRegistry, progs: Option<&Path>) {
    let Some(dir) = progs else {
        info!("Signal SIGHUP received, no program directory configured");
        return;
    };

    info!(dir = ?dir, "Signal SIGHUP received, reloading programs");
    match registry.reload_directory(dir) {
        Ok(report) => {
            for (path, e) in &report.failed {
                warn!(path = ?path, error = %e, "Program failed to reload");
            }
            info!(
                loaded = report.loaded.len(),
                failed = report.failed.len(),
                unloaded = report.unloaded.len(),
                "Finished program reload"
            );
        }
        Err(e) => warn!(error = %e, "Failed to reload programs"),
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg, use_stderr: bool) -> Result<LoggerGuard, BoxError> {
    use std::io::{self, IsTerminal};

    LogTracer::init()?;

    let (non_blocking_writer, guard) = if use_stderr {
        tracing_appender::non_blocking(io::stderr())
    } else {
        tracing_appender::non_blocking(io::stdout())
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("notify=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // Skip color codes when not in a terminal
        let use_ansi = if use_stderr {
            io::stderr().is_terminal()
        } else {
            io::stdout().is_terminal()
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentSignal {
    Shutdown,
    Reload,
}

#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal. SIGINT and SIGTERM shut down, SIGHUP reloads.
    async fn next(&mut self) -> AgentSignal {
        select! {
            _ = self.term.recv() => AgentSignal::Shutdown,
            _ = self.int.recv() => AgentSignal::Shutdown,
            _ = self.hup.recv() => AgentSignal::Reload,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> AgentSignal {
        let _ = tokio::signal::ctrl_c().await;
        AgentSignal::Shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_command() {
        let args = Arguments::try_parse_from([
            "logmill",
            "--log-format",
            "json",
            "start",
            "--logs",
            "/var/log/app.log",
            "--one-shot",
        ])
        .unwrap();

        assert_eq!(args.log_format, LogFormatArg::Json);
        match args.command {
            Some(Commands::Start(run)) => {
                assert!(run.one_shot);
                assert_eq!(run.logs.len(), 1);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_check_requires_progs() {
        assert!(Arguments::try_parse_from(["logmill", "check"]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signals_map_to_actions() {
        let mut signals = Signals::new().unwrap();

        unsafe { libc::raise(libc::SIGHUP) };
        let signal = tokio::time::timeout(Duration::from_secs(5), signals.next())
            .await
            .unwrap();
        assert_eq!(signal, AgentSignal::Reload);

        unsafe { libc::raise(libc::SIGTERM) };
        let signal = tokio::time::timeout(Duration::from_secs(5), signals.next())
            .await
            .unwrap();
        assert_eq!(signal, AgentSignal::Shutdown);
    }

    #[test]
    fn test_reload_programs_picks_up_new_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry =
            ProgramRegistry::new(Arc::new(RuleCompiler::new()), Arc::new(MetricStore::new()));

        std::fs::write(dir.path().join("a.rules"), "/x/ inc a\n").unwrap();
        reload_programs(&registry, Some(dir.path()));
        assert_eq!(registry.names(), vec!["a.rules".to_string()]);

        std::fs::remove_file(dir.path().join("a.rules")).unwrap();
        reload_programs(&registry, Some(dir.path()));
        assert!(registry.is_empty());

        reload_programs(&registry, None);
    }
}
