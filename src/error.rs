// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

use crate::metrics::MetricError;
use crate::program::CompileError;
use crate::tailer::watcher::WatcherError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read program {path:?}: {source}")]
    ProgramRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Tailer already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used at task and process boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
