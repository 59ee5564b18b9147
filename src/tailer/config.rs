// SPDX-License-Identifier: Apache-2.0

//! Configuration for the tailer.

use clap::ValueEnum;
use serde::Deserialize;
use std::time::Duration;

use crate::tailer::watcher::WatchMode;

/// Where to start reading a file that already exists when its path is first polled.
///
/// Files that appear at a registered path later on (created after
/// registration, or the replacement after a rotation) are always read from
/// the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StartAt {
    /// Start reading from the beginning of the file
    Beginning,
    /// Start reading from the end of the file (only new content)
    #[default]
    End,
}

/// What drives the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSchedule {
    /// Poll every registered stream on a fixed interval
    Every(Duration),
    /// Only poll when a [`PollTrigger`](crate::tailer::PollTrigger) asks for it
    /// or a native change notification arrives
    Manual,
}

impl Default for PollSchedule {
    fn default() -> Self {
        PollSchedule::Every(Duration::from_millis(250))
    }
}

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub schedule: PollSchedule,
    pub start_at: StartAt,
    /// Native notifications, polling only, or native with fallback
    pub watch_mode: WatchMode,
    /// How long to batch native change notifications before polling
    pub debounce_interval: Duration,
    /// Maximum log line size in bytes. Longer lines are truncated.
    pub max_line_size: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            schedule: PollSchedule::default(),
            start_at: StartAt::End,
            watch_mode: WatchMode::Auto,
            debounce_interval: Duration::from_millis(100),
            max_line_size: 65536,
        }
    }
}

impl TailerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if let PollSchedule::Every(interval) = self.schedule {
            if interval.is_zero() {
                return Err("Poll interval must be greater than zero".to_string());
            }
        }

        if self.max_line_size == 0 {
            return Err("Maximum line size must be greater than zero".to_string());
        }

        Ok(())
    }
}
