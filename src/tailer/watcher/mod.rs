// SPDX-License-Identifier: Apache-2.0

//! File system watcher abstractions for the tailer.
//!
//! This module provides two watching strategies:
//! - **Native watching**: Uses OS-level file system notifications (inotify on Linux,
//!   FSEvents on macOS, ReadDirectoryChangesW on Windows) to poll a stream early.
//! - **Poll watching**: Relies on the poll interval alone, for environments
//!   where native watching isn't available or reliable (e.g., NFS, network shares).
//!
//! The recommended approach is to use `auto` mode which attempts native watching
//! first and falls back to polling if it fails.

mod native;
mod poll;
mod traits;

pub use native::NativeWatcher;
pub use poll::PollWatcher;
pub use traits::{EventSink, FileEvent, FileEventKind, FileWatcher, WatcherError};

use clap::ValueEnum;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Watch mode configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Try native watching first, fall back to polling on failure.
    #[default]
    Auto,
    /// Force native file system watching. Fails if it is not supported.
    Native,
    /// Force polling mode. Use this for network file systems (NFS)
    /// or when native watching is unreliable.
    #[value(alias = "polling")]
    #[serde(alias = "polling")]
    Poll,
}

/// Create a watcher for `mode`, delivering native events to `sink`.
pub fn create_watcher(
    mode: WatchMode,
    sink: EventSink,
) -> Result<Box<dyn FileWatcher>, WatcherError> {
    match mode {
        WatchMode::Native => Ok(Box::new(NativeWatcher::new(sink)?)),
        WatchMode::Poll => Ok(Box::new(PollWatcher::new())),
        WatchMode::Auto => match NativeWatcher::new(sink) {
            Ok(watcher) => {
                info!("Using native file system watcher");
                Ok(Box::new(watcher))
            }
            Err(e) => {
                warn!(
                    "Native file watching unavailable ({}), falling back to polling",
                    e
                );
                Ok(Box::new(PollWatcher::new()))
            }
        },
    }
}

/// Reference-counted directory watches for a set of registered file paths.
///
/// Files are watched through their parent directory so that creation and
/// replacement of the file are reported too.
pub struct WatchSet {
    watcher: Box<dyn FileWatcher>,
    dirs: HashMap<PathBuf, usize>,
}

impl WatchSet {
    pub fn new(watcher: Box<dyn FileWatcher>) -> Self {
        Self {
            watcher,
            dirs: HashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.watcher.backend_name()
    }

    pub fn add(&mut self, file: &Path) {
        let Some(dir) = file.parent() else {
            return;
        };

        let count = self.dirs.entry(dir.to_path_buf()).or_insert(0);
        *count += 1;
        if *count == 1 {
            match self.watcher.watch(dir) {
                Ok(()) => debug!(dir = ?dir, backend = self.watcher.backend_name(), "Watching directory"),
                Err(e) => warn!(
                    dir = ?dir,
                    error = %e,
                    "Unable to watch directory, relying on polling"
                ),
            }
        }
    }

    pub fn remove(&mut self, file: &Path) {
        let Some(dir) = file.parent() else {
            return;
        };
        let Some(count) = self.dirs.get_mut(dir) else {
            return;
        };

        *count -= 1;
        if *count == 0 {
            self.dirs.remove(dir);
            if let Err(e) = self.watcher.unwatch(dir) {
                debug!(dir = ?dir, error = %e, "Failed to unwatch directory");
            }
        }
    }

    pub fn watched_dirs(&self) -> usize {
        self.dirs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FileWatcher for Recorder {
        fn watch(&mut self, dir: &Path) -> Result<(), WatcherError> {
            self.calls.lock().unwrap().push(format!("watch {}", dir.display()));
            Ok(())
        }

        fn unwatch(&mut self, dir: &Path) -> Result<(), WatcherError> {
            self.calls.lock().unwrap().push(format!("unwatch {}", dir.display()));
            Ok(())
        }

        fn is_native(&self) -> bool {
            false
        }

        fn backend_name(&self) -> &'static str {
            "recorder"
        }
    }

    #[test]
    fn test_watch_mode_parse() {
        assert_eq!(WatchMode::from_str("auto", true).unwrap(), WatchMode::Auto);
        assert_eq!(WatchMode::from_str("native", true).unwrap(), WatchMode::Native);
        assert_eq!(WatchMode::from_str("poll", true).unwrap(), WatchMode::Poll);
        assert_eq!(WatchMode::from_str("polling", true).unwrap(), WatchMode::Poll);
        assert_eq!(WatchMode::from_str("AUTO", true).unwrap(), WatchMode::Auto);
        assert!(WatchMode::from_str("invalid", true).is_err());

        let v: WatchMode = serde_json::from_str("\"polling\"").unwrap();
        assert_eq!(v, WatchMode::Poll);
    }

    #[test]
    fn test_watch_set_ref_counts_directories() {
        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        let mut set = WatchSet::new(Box::new(recorder));

        set.add(Path::new("/logs/a.log"));
        set.add(Path::new("/logs/b.log"));
        set.add(Path::new("/other/c.log"));
        assert_eq!(set.watched_dirs(), 2);

        set.remove(Path::new("/logs/a.log"));
        assert_eq!(set.watched_dirs(), 2);
        set.remove(Path::new("/logs/b.log"));
        assert_eq!(set.watched_dirs(), 1);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["watch /logs", "watch /other", "unwatch /logs"]
        );
    }

    #[test]
    fn test_create_poll_watcher() {
        let sink: EventSink = Arc::new(|_| {});
        let watcher = create_watcher(WatchMode::Poll, sink).unwrap();
        assert!(!watcher.is_native());
    }
}
