// SPDX-License-Identifier: Apache-2.0

//! Tails log files through rotation and runs every loaded extraction program
//! against every appended line, updating an owned metric store.

pub mod bounded_channel;
pub mod dispatcher;
pub mod error;
pub mod init;
pub mod metrics;
pub mod program;
pub mod tailer;

pub use error::{BoxError, Error, Result};
