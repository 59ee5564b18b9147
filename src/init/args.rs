// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::init::agent::AgentConfig;
use crate::tailer::{PollSchedule, StartAt, TailerConfig, WatchMode};

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Log files to tail (comma separated, exact paths)
    #[arg(long, env = "LOGMILL_LOGS", value_delimiter = ',')]
    pub logs: Vec<PathBuf>,

    /// Directory of extraction programs
    #[arg(long, env = "LOGMILL_PROGS")]
    pub progs: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long, env = "LOGMILL_POLL_INTERVAL_MS", default_value = "250")]
    pub poll_interval_ms: u64,

    /// Where to start reading files that exist at startup
    #[arg(value_enum, long, env = "LOGMILL_START_AT", default_value = "end")]
    pub start_at: StartAt,

    /// File watch mode
    #[arg(value_enum, long, env = "LOGMILL_WATCH_MODE", default_value = "auto")]
    pub watch_mode: WatchMode,

    /// Debounce interval for native file events in milliseconds
    #[arg(long, env = "LOGMILL_DEBOUNCE_INTERVAL_MS", default_value = "100")]
    pub debounce_interval_ms: u64,

    /// Maximum log line size in bytes
    #[arg(long, env = "LOGMILL_MAX_LINE_SIZE", default_value = "65536")]
    pub max_line_size: usize,

    /// Number of dispatcher shards
    #[arg(long, env = "LOGMILL_DISPATCH_WORKERS", default_value = "1")]
    pub dispatch_workers: usize,

    /// Capacity of the line queue between the tailer and the dispatcher
    #[arg(long, env = "LOGMILL_LINE_QUEUE_SIZE", default_value = "1024")]
    pub line_queue_size: usize,

    /// How long to wait for in-flight lines on shutdown, in milliseconds
    #[arg(long, env = "LOGMILL_SHUTDOWN_TIMEOUT_MS", default_value = "3000")]
    pub shutdown_timeout_ms: u64,

    /// Read every log from the beginning to its current end, print the metrics and exit
    #[arg(long, env = "LOGMILL_ONE_SHOT", default_value = "false")]
    pub one_shot: bool,
}

impl AgentRun {
    pub fn build_config(&self) -> AgentConfig {
        AgentConfig {
            logs: self.logs.clone(),
            progs: self.progs.clone(),
            tailer: TailerConfig {
                schedule: PollSchedule::Every(Duration::from_millis(self.poll_interval_ms)),
                start_at: self.start_at,
                watch_mode: self.watch_mode,
                debounce_interval: Duration::from_millis(self.debounce_interval_ms),
                max_line_size: self.max_line_size,
            },
            dispatcher: DispatcherConfig {
                workers: self.dispatch_workers,
                queue_size: self.line_queue_size,
            },
            line_queue_size: self.line_queue_size,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    /// Directory of extraction programs to compile
    #[arg(long, env = "LOGMILL_PROGS")]
    pub progs: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        run: AgentRun,
    }

    #[test]
    fn test_defaults_match_config_defaults() {
        let cli = TestCli::try_parse_from(["logmill"]).unwrap();
        let config = cli.run.build_config();

        let tailer = TailerConfig::default();
        assert_eq!(config.tailer.schedule, tailer.schedule);
        assert_eq!(config.tailer.start_at, tailer.start_at);
        assert_eq!(config.tailer.watch_mode, tailer.watch_mode);
        assert_eq!(config.tailer.debounce_interval, tailer.debounce_interval);
        assert_eq!(config.tailer.max_line_size, tailer.max_line_size);
        assert_eq!(config.dispatcher.workers, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert!(config.logs.is_empty());
        assert!(!cli.run.one_shot);
    }

    #[test]
    fn test_parse_options() {
        let cli = TestCli::try_parse_from([
            "logmill",
            "--logs",
            "/var/log/a.log,/var/log/b.log",
            "--progs",
            "/etc/logmill",
            "--start-at",
            "beginning",
            "--watch-mode",
            "poll",
            "--poll-interval-ms",
            "50",
            "--dispatch-workers",
            "4",
        ])
        .unwrap();
        let config = cli.run.build_config();

        assert_eq!(
            config.logs,
            vec![PathBuf::from("/var/log/a.log"), PathBuf::from("/var/log/b.log")]
        );
        assert_eq!(config.progs, Some(PathBuf::from("/etc/logmill")));
        assert_eq!(config.tailer.start_at, StartAt::Beginning);
        assert_eq!(config.tailer.watch_mode, WatchMode::Poll);
        assert_eq!(
            config.tailer.schedule,
            PollSchedule::Every(Duration::from_millis(50))
        );
        assert_eq!(config.dispatcher.workers, 4);
    }

    #[test]
    fn test_rejects_unknown_start_at() {
        assert!(TestCli::try_parse_from(["logmill", "--start-at", "middle"]).is_err());
    }
}
