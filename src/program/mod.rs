// SPDX-License-Identifier: Apache-2.0

//! Compile and execution contracts for extraction programs.
//!
//! A [`Compiler`] turns named source text into an opaque [`Program`]. The
//! [`ProgramRegistry`] holds the programs currently loaded and hands out
//! consistent snapshots to the dispatcher.

mod registry;
mod rules;

pub use registry::{LoadReport, LoadedProgram, ProgramRegistry};
pub use rules::RuleCompiler;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::metrics::MetricStore;

/// One complete line read from a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Registered path the line was read from
    pub source: Arc<Path>,
    /// Line text without the terminating newline, lossily decoded
    pub text: String,
    /// Per-stream sequence number, starting at 0
    pub seq: u64,
}

impl LogLine {
    pub fn new(source: Arc<Path>, text: impl Into<String>, seq: u64) -> Self {
        Self {
            source,
            text: text.into(),
            seq,
        }
    }
}

/// 1-based location inside program source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{program}:{position}: {message}")]
pub struct CompileError {
    pub program: String,
    pub position: Position,
    pub message: String,
}

impl CompileError {
    pub fn new(program: &str, line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            program: program.to_string(),
            position: Position { line, column },
            message: message.into(),
        }
    }
}

/// A program failed while handling one line. Isolated to that program and line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RuntimeFault {
    pub message: String,
}

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A compiled extraction program.
///
/// Implementations must be safe to execute from several dispatcher shards at
/// once; all mutable state lives in the [`MetricStore`].
pub trait Program: Send + Sync {
    fn execute(&self, line: &LogLine, store: &MetricStore) -> Result<(), RuntimeFault>;
}

pub trait Compiler: Send + Sync {
    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn Program>, CompileError>;

    /// File extension, without the dot, of source files this compiler accepts.
    fn extension(&self) -> &str;
}
