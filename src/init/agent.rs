// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::bounded;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{BoxError, Error, Result};
use crate::init::wait::{self, TaskSet};
use crate::metrics::{MetricSnapshot, MetricStore};
use crate::program::{Compiler, LoadReport, ProgramRegistry, RuleCompiler};
use crate::tailer::{LogStream, StartAt, Tailer, TailerConfig};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Exact paths of the logs to tail
    pub logs: Vec<PathBuf>,
    /// Directory of extraction programs
    pub progs: Option<PathBuf>,
    pub tailer: TailerConfig,
    pub dispatcher: DispatcherConfig,
    /// Capacity of the tailer to dispatcher queue
    pub line_queue_size: usize,
    /// Upper bound on each shutdown step
    pub shutdown_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            logs: Vec::new(),
            progs: None,
            tailer: TailerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            line_queue_size: 1024,
            shutdown_timeout: Duration::from_millis(3000),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.logs.is_empty() {
            return Err("At least one log path must be specified".to_string());
        }
        if self.line_queue_size == 0 {
            return Err("Line queue size must be greater than zero".to_string());
        }
        self.tailer.validate()?;
        self.dispatcher.validate()
    }
}

/// Owns the metric store, the program registry, the tailer and the
/// dispatcher, and ties their lifecycles together.
pub struct Agent {
    config: AgentConfig,
    store: Arc<MetricStore>,
    registry: Arc<ProgramRegistry>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self::with_compiler(config, Arc::new(RuleCompiler::new()))
    }

    pub fn with_compiler(config: AgentConfig, compiler: Arc<dyn Compiler>) -> Self {
        let store = Arc::new(MetricStore::new());
        let registry = Arc::new(ProgramRegistry::new(compiler, store.clone()));
        Self {
            config,
            store,
            registry,
        }
    }

    pub fn store(&self) -> Arc<MetricStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<ProgramRegistry> {
        self.registry.clone()
    }

    /// Load the configured program directory, if any. Individual compile
    /// failures are logged and reported, not fatal.
    pub fn load_programs(&self) -> Result<Option<LoadReport>> {
        let Some(dir) = &self.config.progs else {
            return Ok(None);
        };

        let report = self.registry.load_directory(dir)?;
        for (path, e) in &report.failed {
            warn!(path = ?path, error = %e, "Program failed to load");
        }
        Ok(Some(report))
    }

    /// Tail every configured log until `cancel` fires, then shut down in order:
    /// stop the tailer (forwarding what it already read), then let the
    /// dispatcher drain its intake.
    pub async fn run(self, cancel: CancellationToken) -> std::result::Result<(), BoxError> {
        self.config.validate().map_err(Error::Config)?;
        self.load_programs()?;

        let (lines_tx, lines_rx) = bounded(self.config.line_queue_size);
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            self.store.clone(),
            self.config.dispatcher.clone(),
        )?;

        let mut tailer = Tailer::new(self.config.tailer.clone(), self.store.clone(), lines_tx);
        for path in &self.config.logs {
            tailer.register_path(path)?;
        }
        tailer.start()?;

        let dispatcher_cancel = CancellationToken::new();
        let mut dispatcher_task_set = TaskSet::new();
        dispatcher_task_set.spawn(dispatcher.run(lines_rx, dispatcher_cancel.clone()));

        info!(
            logs = self.config.logs.len(),
            programs = self.registry.len(),
            "Agent started"
        );

        let mut result = Ok(());
        select! {
            _ = cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut dispatcher_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of dispatcher."),
                    Err(e) => result = Err(e),
                }
            },
        }

        // Joining the tailer threads blocks.
        let stop = tokio::task::spawn_blocking(move || tailer.stop());
        match tokio::time::timeout(self.config.shutdown_timeout, stop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to join tailer shutdown: {}", e),
            Err(_) => warn!("Timed out waiting for tailer to stop"),
        }
        result?;

        // The intake is closed now; the dispatcher exits once it is drained.
        let res =
            wait::wait_for_tasks_with_timeout(&mut dispatcher_task_set, self.config.shutdown_timeout)
                .await;
        if res.is_err() {
            warn!("Dispatcher did not drain in time, cancelling.");
            dispatcher_cancel.cancel();
            wait::wait_for_tasks_with_timeout(&mut dispatcher_task_set, Duration::from_millis(500))
                .await
                .map_err(|e| format!("timed out waiting for dispatcher to exit: {}", e))?;
        }

        info!("Agent stopped");
        Ok(())
    }

    /// Read every configured log from the beginning to its current end,
    /// dispatch all lines and return the resulting metrics.
    pub fn run_one_shot(&self) -> Result<Vec<MetricSnapshot>> {
        self.load_programs()?;
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            self.store.clone(),
            self.config.dispatcher.clone(),
        )?;

        for path in &self.config.logs {
            let path = std::path::absolute(path)?;
            let mut stream = LogStream::new(
                path.as_path(),
                StartAt::Beginning,
                self.config.tailer.max_line_size,
            );
            let summary = stream.poll_into(|line| dispatcher.dispatch(&line));
            debug!(path = ?path, lines = summary.lines, "Processed log");
        }

        Ok(self.store.snapshot())
    }
}
