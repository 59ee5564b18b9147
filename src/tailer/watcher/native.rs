// SPDX-License-Identifier: Apache-2.0

//! Native file system watcher using the `notify` crate.
//!
//! Uses OS-level file system notifications:
//! - Linux: inotify
//! - macOS: FSEvents
//! - Windows: ReadDirectoryChangesW

use std::path::Path;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use super::traits::{EventSink, FileEvent, FileEventKind, FileWatcher, WatcherError};

/// Native file system watcher using OS-level notifications.
pub struct NativeWatcher {
    watcher: RecommendedWatcher,
}

impl NativeWatcher {
    /// Create a native watcher that hands every relevant event to `sink`.
    pub fn new(sink: EventSink) -> Result<Self, WatcherError> {
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Some(file_event) = Self::convert_event(event) {
                        sink(file_event);
                    }
                }
                Err(e) => warn!("File watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self { watcher })
    }

    /// Convert a notify event to our FileEvent type
    fn convert_event(event: Event) -> Option<FileEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Create,
            EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Other,
            EventKind::Modify(_) => FileEventKind::Modify,
            EventKind::Remove(_) => FileEventKind::Remove,
            EventKind::Access(_) => return None,
            EventKind::Other | EventKind::Any => FileEventKind::Other,
        };

        if event.paths.is_empty() {
            return None;
        }

        Some(FileEvent::new(kind, event.paths))
    }
}

impl FileWatcher for NativeWatcher {
    fn watch(&mut self, dir: &Path) -> Result<(), WatcherError> {
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn unwatch(&mut self, dir: &Path) -> Result<(), WatcherError> {
        self.watcher
            .unwatch(dir)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn is_native(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(target_os = "windows")]
        {
            "ReadDirectoryChangesW"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            "native"
        }
    }
}
