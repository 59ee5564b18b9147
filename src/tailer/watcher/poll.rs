// SPDX-License-Identifier: Apache-2.0

//! Fallback for systems where native notifications are unavailable or
//! unreliable (e.g., NFS). It reports no events; every stream is still
//! checked on each poll interval.

use std::path::{Path, PathBuf};

use super::traits::{FileWatcher, WatcherError};

#[derive(Debug, Default)]
pub struct PollWatcher {
    watched_dirs: Vec<PathBuf>,
}

impl PollWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.watched_dirs
    }
}

impl FileWatcher for PollWatcher {
    fn watch(&mut self, dir: &Path) -> Result<(), WatcherError> {
        if !self.watched_dirs.iter().any(|d| d == dir) {
            self.watched_dirs.push(dir.to_path_buf());
        }
        Ok(())
    }

    fn unwatch(&mut self, dir: &Path) -> Result<(), WatcherError> {
        self.watched_dirs.retain(|d| d != dir);
        Ok(())
    }

    fn is_native(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_watcher_tracks_dirs() {
        let mut watcher = PollWatcher::new();
        watcher.watch(Path::new("/var/log")).unwrap();
        watcher.watch(Path::new("/var/log")).unwrap();
        watcher.watch(Path::new("/tmp")).unwrap();
        assert_eq!(watcher.watched_dirs().len(), 2);

        watcher.unwatch(Path::new("/var/log")).unwrap();
        assert_eq!(watcher.watched_dirs(), &[PathBuf::from("/tmp")]);
    }

    #[test]
    fn test_poll_watcher_is_not_native() {
        let watcher = PollWatcher::new();
        assert!(!watcher.is_native());
        assert_eq!(watcher.backend_name(), "poll");
    }
}
