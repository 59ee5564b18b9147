// SPDX-License-Identifier: Apache-2.0

//! Rotation-aware tailing of an explicit list of log file paths.
//!
//! Each registered path gets a [`LogStream`] that survives rename, truncate
//! and recreate rotations. The [`Tailer`] polls the streams on a schedule (or
//! on demand through a [`PollTrigger`]) and forwards every new line to a
//! bounded channel.

pub mod config;
mod coordinator;
pub mod file_id;
pub mod stream;
pub mod watcher;

pub use config::{PollSchedule, StartAt, TailerConfig};
pub use coordinator::{PollTrigger, Tailer};
pub use stream::{LogStream, PollSummary, StreamStatus};
pub use watcher::WatchMode;
