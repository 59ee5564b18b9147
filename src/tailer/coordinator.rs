// SPDX-License-Identifier: Apache-2.0

//! Poll driver: one coordinator thread plus one worker thread per registered path.
//!
//! The coordinator owns the path registry and the watcher, and decides when
//! streams are polled. Each worker exclusively owns one [`LogStream`] and
//! forwards its lines, in file order, to the dispatcher intake.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::error::{Error, Result};
use crate::metrics::{self, Counter, MetricStore};
use crate::program::LogLine;
use crate::tailer::config::{PollSchedule, TailerConfig};
use crate::tailer::stream::LogStream;
use crate::tailer::watcher::{self, EventSink, FileEvent, WatchSet};

/// A request for one poll. The ack sender is dropped once the poll's lines
/// have been forwarded.
struct PollRequest {
    ack: Option<flume::Sender<()>>,
}

enum Signal {
    Tick(Option<flume::Sender<()>>),
    Hint(FileEvent),
    Register(PathBuf),
    Unregister(PathBuf),
    Shutdown,
}

/// Handle to request polls of every registered stream.
#[derive(Clone)]
pub struct PollTrigger {
    signal_tx: flume::Sender<Signal>,
}

impl PollTrigger {
    /// Request a poll of every stream without waiting for it.
    pub fn tick(&self) {
        let _ = self.signal_tx.send(Signal::Tick(None));
    }

    /// Request a poll of every stream and wait until each has finished it and
    /// forwarded its lines. Returns false on timeout or if the tailer is not running.
    pub fn tick_and_wait(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = flume::bounded::<()>(0);
        if self.signal_tx.send(Signal::Tick(Some(ack_tx))).is_err() {
            return false;
        }

        // Nothing is ever sent: every ack sender being dropped is the signal.
        matches!(
            ack_rx.recv_timeout(timeout),
            Err(flume::RecvTimeoutError::Disconnected)
        )
    }
}

/// Owns the log streams of all registered paths and drives their polling.
pub struct Tailer {
    config: TailerConfig,
    store: Arc<MetricStore>,
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
    signal_tx: flume::Sender<Signal>,
    signal_rx: Option<flume::Receiver<Signal>>,
    lines_tx: Option<BoundedSender<LogLine>>,
    coordinator: Option<JoinHandle<()>>,
}

impl Tailer {
    pub fn new(
        config: TailerConfig,
        store: Arc<MetricStore>,
        lines_tx: BoundedSender<LogLine>,
    ) -> Self {
        let (signal_tx, signal_rx) = flume::unbounded();
        Self {
            config,
            store,
            paths: Arc::new(Mutex::new(BTreeSet::new())),
            signal_tx,
            signal_rx: Some(signal_rx),
            lines_tx: Some(lines_tx),
            coordinator: None,
        }
    }

    /// Add `path` to the allow-list. Relative paths are made absolute.
    /// Returns false if it was already registered.
    pub fn register_path(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = std::path::absolute(path.as_ref())?;
        if !self.paths.lock().insert(path.clone()) {
            return Ok(false);
        }

        debug!(path = ?path, "Registered log path");
        let _ = self.signal_tx.send(Signal::Register(path));
        Ok(true)
    }

    /// Remove `path`. Its stream is dropped after any in-flight poll.
    /// Returns false if it was not registered.
    pub fn unregister_path(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = std::path::absolute(path.as_ref())?;
        if !self.paths.lock().remove(&path) {
            return Ok(false);
        }

        debug!(path = ?path, "Unregistered log path");
        let _ = self.signal_tx.send(Signal::Unregister(path));
        Ok(true)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().iter().cloned().collect()
    }

    pub fn trigger(&self) -> PollTrigger {
        PollTrigger {
            signal_tx: self.signal_tx.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_some()
    }

    /// Start the coordinator thread. Paths registered so far are picked up
    /// immediately; later registrations take effect as they happen.
    pub fn start(&mut self) -> Result<()> {
        let (Some(signal_rx), Some(lines_tx)) = (self.signal_rx.take(), self.lines_tx.take())
        else {
            return Err(Error::AlreadyStarted);
        };

        let hint_tx = self.signal_tx.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = hint_tx.send(Signal::Hint(event));
        });
        let watcher = match watcher::create_watcher(self.config.watch_mode, sink) {
            Ok(w) => w,
            Err(e) => {
                // Leave the tailer startable once the config is fixed.
                self.signal_rx = Some(signal_rx);
                self.lines_tx = Some(lines_tx);
                return Err(e.into());
            }
        };

        let coordinator = Coordinator {
            config: self.config.clone(),
            store: self.store.clone(),
            lines_tx,
            signal_rx,
            watch: WatchSet::new(watcher),
            workers: HashMap::new(),
            next_worker_id: 0,
            hint_aliases: HashMap::new(),
            hinted: HashSet::new(),
            hint_deadline: None,
        };

        info!(
            schedule = ?self.config.schedule,
            start_at = ?self.config.start_at,
            backend = coordinator.watch.backend_name(),
            "Starting tailer"
        );

        let handle = std::thread::Builder::new()
            .name("logmill-tailer".to_string())
            .spawn(move || coordinator.run())?;
        self.coordinator = Some(handle);
        Ok(())
    }

    /// Stop polling. In-flight polls complete and their lines are forwarded
    /// before this returns. Calling it again is harmless.
    pub fn stop(&mut self) {
        // Never started: just release the intake sender.
        self.lines_tx = None;

        let Some(handle) = self.coordinator.take() else {
            return;
        };

        let _ = self.signal_tx.send(Signal::Shutdown);
        match handle.join() {
            Ok(()) => info!("Tailer stopped"),
            Err(_) => error!("Tailer coordinator thread panicked"),
        }
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    tx: flume::Sender<PollRequest>,
    handle: JoinHandle<()>,
}

struct Coordinator {
    config: TailerConfig,
    store: Arc<MetricStore>,
    lines_tx: BoundedSender<LogLine>,
    signal_rx: flume::Receiver<Signal>,
    watch: WatchSet,
    workers: HashMap<PathBuf, Worker>,
    next_worker_id: u64,
    /// Symlink-resolved spellings of registered paths, as native events may report them
    hint_aliases: HashMap<PathBuf, PathBuf>,
    /// Paths named by native events since the last hinted poll
    hinted: HashSet<PathBuf>,
    hint_deadline: Option<Instant>,
}

impl Coordinator {
    fn run(mut self) {
        let interval = match self.config.schedule {
            PollSchedule::Every(interval) => Some(interval),
            PollSchedule::Manual => None,
        };
        let mut next_tick = interval.map(|i| Instant::now() + i);

        loop {
            let deadline = match (next_tick, self.hint_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let signal = match deadline {
                Some(deadline) => match self.signal_rx.recv_deadline(deadline) {
                    Ok(signal) => Some(signal),
                    Err(flume::RecvTimeoutError::Timeout) => None,
                    Err(flume::RecvTimeoutError::Disconnected) => Some(Signal::Shutdown),
                },
                None => Some(self.signal_rx.recv().unwrap_or(Signal::Shutdown)),
            };

            match signal {
                None => {
                    let now = Instant::now();
                    if let (Some(tick), Some(interval)) = (next_tick, interval) {
                        if tick <= now {
                            self.poll_all(None);
                            next_tick = Some(now + interval);
                            // A full poll covers every pending hint.
                            self.hinted.clear();
                            self.hint_deadline = None;
                        }
                    }
                    if self.hint_deadline.is_some_and(|d| d <= now) {
                        self.poll_hinted();
                    }
                }
                Some(Signal::Tick(ack)) => self.poll_all(ack),
                Some(Signal::Hint(event)) => self.on_hint(event),
                Some(Signal::Register(path)) => self.add_stream(path),
                Some(Signal::Unregister(path)) => self.remove_stream(&path),
                Some(Signal::Shutdown) => break,
            }
        }

        self.shutdown();
    }

    fn poll_all(&self, ack: Option<flume::Sender<()>>) {
        for worker in self.workers.values() {
            let _ = worker.tx.send(PollRequest { ack: ack.clone() });
        }
    }

    fn on_hint(&mut self, event: FileEvent) {
        let mut matched = false;
        for path in &event.paths {
            let registered = if self.workers.contains_key(path) {
                Some(path)
            } else {
                self.hint_aliases.get(path)
            };
            if let Some(registered) = registered {
                self.hinted.insert(registered.clone());
                matched = true;
            }
        }

        if matched && self.hint_deadline.is_none() {
            self.hint_deadline = Some(Instant::now() + self.config.debounce_interval);
        }
    }

    fn poll_hinted(&mut self) {
        for path in self.hinted.drain() {
            if let Some(worker) = self.workers.get(&path) {
                debug!(path = ?path, "Polling after change notification");
                let _ = worker.tx.send(PollRequest { ack: None });
            }
        }
        self.hint_deadline = None;
    }

    fn add_stream(&mut self, path: PathBuf) {
        if self.workers.contains_key(&path) {
            return;
        }

        let stream = LogStream::new(
            path.as_path(),
            self.config.start_at,
            self.config.max_line_size,
        );
        let (tx, rx) = flume::unbounded();
        let ctx = WorkerContext {
            lines_tx: self.lines_tx.clone(),
            rotations: self.store.counter(metrics::LOG_ROTATIONS).ok(),
            read_errors: self.store.counter(metrics::LOG_READ_ERRORS).ok(),
        };

        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let spawned = std::thread::Builder::new()
            .name(format!("logmill-stream-{}", id))
            .spawn(move || run_worker(stream, rx, ctx));
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                error!(path = ?path, error = %e, "Failed to spawn stream worker");
                return;
            }
        };

        // First poll right away so registration after start is not delayed a tick.
        let _ = tx.send(PollRequest { ack: None });
        self.watch.add(&path);
        if let Some(alias) = resolved_path(&path) {
            debug!(path = ?path, alias = ?alias, "Matching change notifications on resolved path");
            self.hint_aliases.insert(alias, path.clone());
        }
        info!(path = ?path, "Tailing log path");
        self.workers.insert(path, Worker { tx, handle });
    }

    fn remove_stream(&mut self, path: &Path) {
        let Some(worker) = self.workers.remove(path) else {
            return;
        };
        self.watch.remove(path);
        self.hinted.remove(path);
        self.hint_aliases.retain(|_, registered| registered != path);

        drop(worker.tx);
        if worker.handle.join().is_err() {
            error!(path = ?path, "Stream worker panicked");
        }
        info!(path = ?path, "Stopped tailing log path");
    }

    fn shutdown(&mut self) {
        debug!(streams = self.workers.len(), "Stopping stream workers");
        // Close every request channel before joining so workers finish in parallel.
        let handles: Vec<_> = self
            .workers
            .drain()
            .map(|(path, worker)| {
                drop(worker.tx);
                (path, worker.handle)
            })
            .collect();

        for (path, handle) in handles {
            if handle.join().is_err() {
                error!(path = ?path, "Stream worker panicked");
            }
        }
    }
}

/// `path` with its parent directory's symlinks resolved, if that differs from `path`.
fn resolved_path(path: &Path) -> Option<PathBuf> {
    let parent = path.parent()?;
    let name = path.file_name()?;
    let resolved = std::fs::canonicalize(parent).ok()?.join(name);
    (resolved != path).then_some(resolved)
}

struct WorkerContext {
    lines_tx: BoundedSender<LogLine>,
    rotations: Option<Counter>,
    read_errors: Option<Counter>,
}

fn run_worker(mut stream: LogStream, rx: flume::Receiver<PollRequest>, ctx: WorkerContext) {
    while let Ok(first) = rx.recv() {
        // One poll satisfies every request queued up behind it.
        let acks: Vec<_> = std::iter::once(first)
            .chain(rx.try_iter())
            .filter_map(|r| r.ack)
            .collect();

        let mut disconnected = false;
        let summary = stream.poll_into(|line| {
            if !disconnected && ctx.lines_tx.send_blocking(line).is_err() {
                disconnected = true;
            }
        });

        if summary.rotated {
            if let Some(c) = &ctx.rotations {
                c.inc();
            }
        }
        if summary.read_error {
            if let Some(c) = &ctx.read_errors {
                c.inc();
            }
        }
        if summary.lines > 0 {
            debug!(path = ?stream.path(), lines = summary.lines, "Read new lines");
        }

        drop(acks);

        if disconnected {
            warn!(path = ?stream.path(), "Line intake closed, stopping stream worker");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{self, BoundedReceiver};
    use crate::metrics::MetricValue;
    use crate::tailer::config::StartAt;
    use crate::tailer::watcher::WatchMode;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    fn manual_config() -> TailerConfig {
        TailerConfig {
            schedule: PollSchedule::Manual,
            start_at: StartAt::Beginning,
            watch_mode: WatchMode::Poll,
            ..Default::default()
        }
    }

    fn tailer(config: TailerConfig) -> (Tailer, BoundedReceiver<LogLine>, Arc<MetricStore>) {
        let store = Arc::new(MetricStore::new());
        let (tx, rx) = bounded_channel::bounded(1024);
        (Tailer::new(config, store.clone(), tx), rx, store)
    }

    fn append(path: &Path, data: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn texts(rx: &BoundedReceiver<LogLine>) -> Vec<String> {
        rx.drain().into_iter().map(|l| l.text).collect()
    }

    fn coordinator() -> Coordinator {
        let (lines_tx, _lines_rx) = bounded_channel::bounded(16);
        let (_signal_tx, signal_rx) = flume::unbounded();
        Coordinator {
            config: manual_config(),
            store: Arc::new(MetricStore::new()),
            lines_tx,
            signal_rx,
            watch: WatchSet::new(Box::new(watcher::PollWatcher::new())),
            workers: HashMap::new(),
            next_worker_id: 0,
            hint_aliases: HashMap::new(),
            hinted: HashSet::new(),
            hint_deadline: None,
        }
    }

    fn thread_name(c: &Coordinator, path: &Path) -> String {
        c.workers[path].handle.thread().name().unwrap().to_string()
    }

    #[test]
    fn test_worker_names_unique_after_unregister() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        let c_path = dir.path().join("c.log");

        let mut c = coordinator();
        c.add_stream(a.clone());
        c.add_stream(b.clone());
        let name_b = thread_name(&c, &b);

        c.remove_stream(&a);
        c.add_stream(c_path.clone());
        let name_c = thread_name(&c, &c_path);

        assert_ne!(name_b, name_c);
        c.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_hint_through_symlinked_directory() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let registered = link.join("app.log");
        let mut c = coordinator();
        c.add_stream(registered.clone());

        let reported = fs::canonicalize(&real).unwrap().join("app.log");
        c.on_hint(FileEvent::new(
            watcher::FileEventKind::Modify,
            vec![reported],
        ));
        assert!(c.hinted.contains(&registered));
        assert!(c.hint_deadline.is_some());

        c.remove_stream(&registered);
        assert!(c.hint_aliases.is_empty());
        c.shutdown();
    }

    #[test]
    fn test_register_is_idempotent_and_absolute() {
        let (t, _rx, _store) = tailer(manual_config());
        assert!(t.register_path("relative.log").unwrap());
        assert!(!t.register_path("relative.log").unwrap());

        let paths = t.paths();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].is_absolute());

        assert!(t.unregister_path("relative.log").unwrap());
        assert!(!t.unregister_path("relative.log").unwrap());
        assert!(t.paths().is_empty());
    }

    #[test]
    fn test_start_twice_fails() {
        let (mut t, _rx, _store) = tailer(manual_config());
        t.start().unwrap();
        assert!(matches!(t.start(), Err(Error::AlreadyStarted)));
        t.stop();
        t.stop();
        assert!(!t.is_running());
    }

    #[test]
    fn test_manual_tick_forwards_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\nb\n");

        let (mut t, rx, _store) = tailer(manual_config());
        t.register_path(&path).unwrap();
        t.start().unwrap();
        let trigger = t.trigger();

        assert!(trigger.tick_and_wait(WAIT));
        assert_eq!(texts(&rx), vec!["a", "b"]);

        append(&path, "c\n");
        assert!(trigger.tick_and_wait(WAIT));
        let lines = rx.drain();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "c");
        assert_eq!(lines[0].seq, 2);
        assert_eq!(&*lines[0].source, path.as_path());
    }

    #[test]
    fn test_tick_without_streams_acks_immediately() {
        let (mut t, _rx, _store) = tailer(manual_config());
        t.start().unwrap();
        assert!(t.trigger().tick_and_wait(WAIT));
    }

    #[test]
    fn test_tick_before_start_times_out() {
        let (t, _rx, _store) = tailer(manual_config());
        assert!(!t.trigger().tick_and_wait(Duration::from_millis(50)));
    }

    #[test]
    fn test_unregistered_path_ignored() {
        let dir = TempDir::new().unwrap();
        let watched = dir.path().join("watched.log");
        let ignored = dir.path().join("ignored.log");

        let (mut t, rx, _store) = tailer(manual_config());
        t.register_path(&watched).unwrap();
        t.start().unwrap();

        append(&ignored, "nope\n");
        append(&watched, "yes\n");
        assert!(t.trigger().tick_and_wait(WAIT));
        assert_eq!(texts(&rx), vec!["yes"]);
    }

    #[test]
    fn test_register_and_unregister_after_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.log");

        let (mut t, rx, _store) = tailer(manual_config());
        t.start().unwrap();
        let trigger = t.trigger();

        append(&path, "one\n");
        t.register_path(&path).unwrap();
        assert!(trigger.tick_and_wait(WAIT));
        assert_eq!(texts(&rx), vec!["one"]);

        t.unregister_path(&path).unwrap();
        append(&path, "two\n");
        assert!(trigger.tick_and_wait(WAIT));
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_rotation_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "1\n");

        let (mut t, rx, store) = tailer(manual_config());
        t.register_path(&path).unwrap();
        t.start().unwrap();
        let trigger = t.trigger();
        assert!(trigger.tick_and_wait(WAIT));

        append(&path, "2\n");
        fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "3\n");
        assert!(trigger.tick_and_wait(WAIT));

        assert_eq!(texts(&rx), vec!["1", "2", "3"]);
        assert_eq!(
            store.get(metrics::LOG_ROTATIONS),
            Some(MetricValue::Counter(1))
        );
    }

    #[test]
    fn test_interval_schedule_polls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");

        let config = TailerConfig {
            schedule: PollSchedule::Every(Duration::from_millis(20)),
            ..manual_config()
        };
        let (mut t, rx, _store) = tailer(config);
        t.register_path(&path).unwrap();
        t.start().unwrap();

        append(&path, "tick\n");
        let line = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(line.text, "tick");
    }

    #[test]
    fn test_stop_closes_intake() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "last\n");

        let (mut t, mut rx, _store) = tailer(manual_config());
        t.register_path(&path).unwrap();
        t.start().unwrap();
        assert!(t.trigger().tick_and_wait(WAIT));
        t.stop();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            assert_eq!(rx.next().await.map(|l| l.text), Some("last".to_string()));
            assert_eq!(rx.next().await, None);
        });
    }
}
