// SPDX-License-Identifier: Apache-2.0

//! Traits and types for file system watchers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("watcher initialization failed: {0}")]
    Init(String),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of file event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    Modify,
    Remove,
    /// Catch-all, including renames whose direction is unknown
    Other,
}

/// A file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    /// The path(s) affected by the event
    pub paths: Vec<PathBuf>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, paths: Vec<PathBuf>) -> Self {
        Self { kind, paths }
    }
}

/// Receives events from a watcher backend, on the backend's own thread.
pub type EventSink = Arc<dyn Fn(FileEvent) + Send + Sync>;

/// Trait for file system watchers.
///
/// Events are hints only: a stream decides what happened to its file by
/// checking the file's identity when it is polled.
pub trait FileWatcher: Send {
    /// Start watching a directory. Events for its direct children are reported.
    fn watch(&mut self, dir: &Path) -> Result<(), WatcherError>;

    /// Stop watching a directory.
    fn unwatch(&mut self, dir: &Path) -> Result<(), WatcherError>;

    /// Returns true for inotify/kqueue/FSEvents watchers, false for poll watchers.
    fn is_native(&self) -> bool;

    /// Name of the watcher backend for logging.
    fn backend_name(&self) -> &'static str;
}
