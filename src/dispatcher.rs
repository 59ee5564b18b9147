// SPDX-License-Identifier: Apache-2.0

//! Runs every loaded program against every line.
//!
//! Lines are sharded by source path, so all lines of one file are handled by
//! one shard in file order while different files proceed concurrently.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::error::{BoxError, Result};
use crate::metrics::{self, Counter, MetricStore};
use crate::program::{LogLine, ProgramRegistry};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of shard tasks
    pub workers: usize,
    /// Capacity of each shard's queue
    pub queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_size: 1024,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.workers == 0 {
            return Err("Dispatcher needs at least one worker".to_string());
        }
        if self.queue_size == 0 {
            return Err("Dispatcher queue size must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ProgramRegistry>,
    store: Arc<MetricStore>,
    config: DispatcherConfig,
    line_count: Counter,
    runtime_errors: Counter,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProgramRegistry>,
        store: Arc<MetricStore>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let line_count = store.counter(metrics::LINE_COUNT)?;
        let runtime_errors = store.counter(metrics::PROGRAM_RUNTIME_ERRORS)?;
        Ok(Self {
            registry,
            store,
            config,
            line_count,
            runtime_errors,
        })
    }

    /// Run every program in the current snapshot on `line`, then count the line.
    ///
    /// A fault or panic in one program is logged and counted; the others still run.
    pub fn dispatch(&self, line: &LogLine) {
        let programs = self.registry.snapshot();
        for loaded in programs.values() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                loaded.program.execute(line, &self.store)
            }));

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(fault)) => {
                    self.runtime_errors.inc();
                    warn!(
                        program = %loaded.name,
                        path = ?line.source,
                        seq = line.seq,
                        error = %fault,
                        "Program failed on line"
                    );
                }
                Err(payload) => {
                    self.runtime_errors.inc();
                    warn!(
                        program = %loaded.name,
                        path = ?line.source,
                        seq = line.seq,
                        panic = panic_message(payload.as_ref()),
                        "Program panicked on line"
                    );
                }
            }
        }

        self.line_count.inc();
    }

    /// Consume `intake` until it closes (draining what is queued) or `cancel` fires.
    pub async fn run(
        self,
        mut intake: BoundedReceiver<LogLine>,
        cancel: CancellationToken,
    ) -> std::result::Result<(), BoxError> {
        info!(workers = self.config.workers, "Starting dispatcher");

        if self.config.workers <= 1 {
            loop {
                select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Dispatcher cancelled");
                        break;
                    }
                    line = intake.next() => match line {
                        Some(line) => self.dispatch(&line),
                        None => break,
                    },
                }
            }
            info!("Dispatcher stopped");
            return Ok(());
        }

        let mut shards: Vec<BoundedSender<LogLine>> = Vec::with_capacity(self.config.workers);
        let mut tasks = JoinSet::new();
        for _ in 0..self.config.workers {
            let (tx, rx) = bounded_channel::bounded(self.config.queue_size);
            shards.push(tx);
            tasks.spawn(run_shard(self.clone(), rx, cancel.clone()));
        }

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Dispatcher cancelled");
                    break;
                }
                line = intake.next() => {
                    let Some(line) = line else { break };
                    let shard = &shards[shard_for(&line.source, shards.len())];
                    select! {
                        _ = cancel.cancelled() => break,
                        res = shard.send(line) => if res.is_err() {
                            warn!("Dispatcher shard closed unexpectedly");
                            break;
                        },
                    }
                }
            }
        }

        // Closing the shard queues lets each shard drain and exit.
        drop(shards);
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Dispatcher shard failed");
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }
}

async fn run_shard(
    dispatcher: Dispatcher,
    mut rx: BoundedReceiver<LogLine>,
    cancel: CancellationToken,
) {
    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,
            line = rx.next() => match line {
                Some(line) => dispatcher.dispatch(&line),
                None => break,
            },
        }
    }
}

fn shard_for(path: &Path, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;
    use crate::program::{CompileError, Compiler, Program, RuleCompiler, RuntimeFault};
    use parking_lot::Mutex;
    use std::path::PathBuf;

    struct Recording {
        seen: Mutex<Vec<(PathBuf, u64)>>,
    }

    impl Program for Recording {
        fn execute(&self, line: &LogLine, _store: &MetricStore) -> std::result::Result<(), RuntimeFault> {
            self.seen.lock().push((line.source.to_path_buf(), line.seq));
            Ok(())
        }
    }

    fn setup() -> (Arc<ProgramRegistry>, Arc<MetricStore>) {
        let store = Arc::new(MetricStore::new());
        let registry = Arc::new(ProgramRegistry::new(
            Arc::new(RuleCompiler::new()),
            store.clone(),
        ));
        (registry, store)
    }

    fn line(path: &str, text: &str, seq: u64) -> LogLine {
        LogLine::new(Arc::from(Path::new(path)), text, seq)
    }

    #[test]
    fn test_dispatch_counts_lines() {
        let (registry, store) = setup();
        registry.load("hi.rules", "/^hi/ inc hi_count").unwrap();
        let d = Dispatcher::new(registry, store.clone(), DispatcherConfig::default()).unwrap();

        d.dispatch(&line("/a.log", "hi", 0));
        d.dispatch(&line("/a.log", "nope", 1));

        assert_eq!(store.get(metrics::LINE_COUNT), Some(MetricValue::Counter(2)));
        assert_eq!(store.get("hi_count"), Some(MetricValue::Counter(1)));
    }

    #[test]
    fn test_line_counted_without_programs() {
        let (registry, store) = setup();
        let d = Dispatcher::new(registry, store.clone(), DispatcherConfig::default()).unwrap();

        d.dispatch(&line("/a.log", "anything", 0));
        assert_eq!(store.get(metrics::LINE_COUNT), Some(MetricValue::Counter(1)));
    }

    struct Panics;

    impl Program for Panics {
        fn execute(&self, _: &LogLine, _: &MetricStore) -> std::result::Result<(), RuntimeFault> {
            panic!("boom");
        }
    }

    /// Rule compiler that also understands a `panic` program.
    struct WithPanics;

    impl Compiler for WithPanics {
        fn compile(&self, name: &str, source: &str) -> std::result::Result<Arc<dyn Program>, CompileError> {
            if source == "panic" {
                return Ok(Arc::new(Panics));
            }
            RuleCompiler::new().compile(name, source)
        }

        fn extension(&self) -> &str {
            "rules"
        }
    }

    #[test]
    fn test_faulting_and_panicking_programs_are_isolated() {
        let store = Arc::new(MetricStore::new());
        let registry = Arc::new(ProgramRegistry::new(Arc::new(WithPanics), store.clone()));
        registry.load("a_good", "/./ inc good").unwrap();
        registry.load("b_fault", r"/(?P<n>\w+)/ inc bad $n").unwrap();
        registry.load("c_panics", "panic").unwrap();
        registry.load("d_good", "/./ inc also_good").unwrap();

        let d = Dispatcher::new(registry, store.clone(), DispatcherConfig::default()).unwrap();
        d.dispatch(&line("/a.log", "word", 0));
        d.dispatch(&line("/a.log", "more", 1));

        assert_eq!(store.get("good"), Some(MetricValue::Counter(2)));
        assert_eq!(store.get("also_good"), Some(MetricValue::Counter(2)));
        assert_eq!(
            store.get(metrics::PROGRAM_RUNTIME_ERRORS),
            Some(MetricValue::Counter(4))
        );
        assert_eq!(store.get(metrics::LINE_COUNT), Some(MetricValue::Counter(2)));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("static str")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload = panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");
    }

    #[tokio::test]
    async fn test_run_drains_until_intake_closes() {
        let (registry, store) = setup();
        registry.load("all.rules", "/./ inc seen").unwrap();
        let d = Dispatcher::new(registry, store.clone(), DispatcherConfig::default()).unwrap();

        let (tx, rx) = bounded_channel::bounded(16);
        for i in 0..10 {
            tx.send(line("/a.log", "x", i)).await.unwrap();
        }
        drop(tx);

        d.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(store.get("seen"), Some(MetricValue::Counter(10)));
        assert_eq!(store.get(metrics::LINE_COUNT), Some(MetricValue::Counter(10)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sharded_run_preserves_per_path_order() {
        let store = Arc::new(MetricStore::new());
        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });

        struct Fixed(Arc<Recording>);
        impl Compiler for Fixed {
            fn compile(
                &self,
                _: &str,
                _: &str,
            ) -> std::result::Result<Arc<dyn Program>, CompileError> {
                Ok(self.0.clone())
            }
            fn extension(&self) -> &str {
                "rec"
            }
        }

        let registry = Arc::new(ProgramRegistry::new(
            Arc::new(Fixed(recording.clone())),
            store.clone(),
        ));
        registry.load("rec", "").unwrap();

        let config = DispatcherConfig {
            workers: 4,
            queue_size: 8,
        };
        let d = Dispatcher::new(registry, store.clone(), config).unwrap();

        let (tx, rx) = bounded_channel::bounded(64);
        let handle = tokio::spawn(d.run(rx, CancellationToken::new()));

        let paths = ["/a.log", "/b.log", "/c.log", "/d.log", "/e.log"];
        for seq in 0..50 {
            for p in &paths {
                tx.send(line(p, "x", seq)).await.unwrap();
            }
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(store.get(metrics::LINE_COUNT), Some(MetricValue::Counter(250)));

        let seen = recording.seen.lock();
        for p in &paths {
            let seqs: Vec<u64> = seen
                .iter()
                .filter(|(path, _)| path == Path::new(p))
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (registry, store) = setup();
        let d = Dispatcher::new(registry, store, DispatcherConfig::default()).unwrap();

        let (_tx, rx) = bounded_channel::bounded::<LogLine>(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(d.run(rx, cancel.clone()));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_shard_for_is_stable() {
        let p = Path::new("/var/log/app.log");
        assert_eq!(shard_for(p, 4), shard_for(p, 4));
        assert!(shard_for(p, 4) < 4);
        assert_eq!(shard_for(p, 1), 0);
    }
}
