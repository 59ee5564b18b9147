// SPDX-License-Identifier: Apache-2.0

//! Per-path state machine that turns file system state into newly appended lines.
//!
//! ```text
//!   NoFile ──open──▶ Open ──identity changed / missing / truncated──▶ RotatedDraining
//!     ▲                │                                                   │
//!     └──read error────┘◀──────────────drain to EOF, drop partial──────────┘
//! ```
//!
//! Rotation is detected only by comparing the identity of the file at the
//! path with the identity of the open handle on each poll.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::mem;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::program::LogLine;
use crate::tailer::config::StartAt;
use crate::tailer::file_id::{self, FileId};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Observable state of a [`LogStream`] between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    NoFile,
    Open,
    RotatedDraining,
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Lines emitted
    pub lines: usize,
    /// A rotation or truncation was handled
    pub rotated: bool,
    /// The open handle failed to read and was closed
    pub read_error: bool,
}

struct OpenFile {
    file: File,
    id: FileId,
    /// Bytes consumed from the start of this handle
    offset: u64,
}

enum StreamState {
    NoFile,
    Open(OpenFile),
    RotatedDraining(OpenFile),
}

pub struct LogStream {
    path: Arc<Path>,
    state: StreamState,
    /// Bytes of the current unterminated line, capped at `max_line_size`
    partial: Vec<u8>,
    /// Bytes consumed since the last newline, including any dropped past the cap
    pending_bytes: u64,
    seq: u64,
    /// Consumed once the path is first found present or absent
    initial: Option<StartAt>,
    /// Where to pick up again after a read error on the same file
    resume: Option<(FileId, u64)>,
    max_line_size: usize,
    open_file: fn(&Path) -> io::Result<File>,
}

impl LogStream {
    pub fn new(path: impl Into<Arc<Path>>, start_at: StartAt, max_line_size: usize) -> Self {
        Self {
            path: path.into(),
            state: StreamState::NoFile,
            partial: Vec::new(),
            pending_bytes: 0,
            seq: 0,
            initial: Some(start_at),
            resume: None,
            max_line_size: max_line_size.max(1),
            open_file: |path| File::open(path),
        }
    }

    #[cfg(test)]
    fn with_opener(mut self, open_file: fn(&Path) -> io::Result<File>) -> Self {
        self.open_file = open_file;
        self
    }

    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    pub fn status(&self) -> StreamStatus {
        match self.state {
            StreamState::NoFile => StreamStatus::NoFile,
            StreamState::Open(_) => StreamStatus::Open,
            StreamState::RotatedDraining(_) => StreamStatus::RotatedDraining,
        }
    }

    pub fn file_id(&self) -> Option<FileId> {
        match &self.state {
            StreamState::Open(open) | StreamState::RotatedDraining(open) => Some(open.id),
            StreamState::NoFile => None,
        }
    }

    /// Read position in the current handle, 0 if no file is open.
    pub fn offset(&self) -> u64 {
        match &self.state {
            StreamState::Open(open) | StreamState::RotatedDraining(open) => open.offset,
            StreamState::NoFile => 0,
        }
    }

    /// Offset just past the last emitted line.
    pub fn committed_offset(&self) -> u64 {
        self.offset().saturating_sub(self.pending_bytes)
    }

    /// Lines emitted so far; also the sequence number of the next line.
    pub fn lines_emitted(&self) -> u64 {
        self.seq
    }

    /// Poll once and collect the lines.
    pub fn poll(&mut self) -> Vec<LogLine> {
        let mut lines = Vec::new();
        self.poll_into(|line| lines.push(line));
        lines
    }

    /// Poll once, handing every complete line to `emit` in file order.
    ///
    /// Never fails: I/O problems leave the stream in a state that is retried
    /// on the next poll, and are reported through the summary.
    pub fn poll_into<F: FnMut(LogLine)>(&mut self, mut emit: F) -> PollSummary {
        let mut summary = PollSummary::default();

        let state = match mem::replace(&mut self.state, StreamState::NoFile) {
            StreamState::Open(open) => self.poll_open(open, &mut emit, &mut summary),
            other => other,
        };

        let state = match state {
            StreamState::RotatedDraining(open) => {
                self.drain(open, &mut emit, &mut summary);
                StreamState::NoFile
            }
            other => other,
        };

        self.state = match state {
            StreamState::NoFile if !summary.read_error => self.try_open(&mut emit, &mut summary),
            other => other,
        };

        summary
    }

    fn poll_open<F: FnMut(LogLine)>(
        &mut self,
        mut open: OpenFile,
        emit: &mut F,
        summary: &mut PollSummary,
    ) -> StreamState {
        match file_id::stat_path(&self.path) {
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Unable to stat log path, retrying next poll");
                StreamState::Open(open)
            }
            Ok(Some(stat)) if stat.id == open.id && stat.len >= open.offset => {
                match self.read(&mut open, Some(stat.len), emit, summary) {
                    Ok(()) => StreamState::Open(open),
                    Err(e) => {
                        self.read_failed(&open, e, summary);
                        StreamState::NoFile
                    }
                }
            }
            Ok(Some(stat)) if stat.id == open.id => {
                info!(
                    path = ?self.path,
                    offset = open.offset,
                    size = stat.len,
                    "Log file truncated"
                );
                StreamState::RotatedDraining(open)
            }
            Ok(current) => {
                let rotated_to = file_id::get_path_from_file(&open.file).ok();
                info!(
                    path = ?self.path,
                    old_file_id = %open.id,
                    new_file_id = ?current.map(|s| s.id.to_string()),
                    rotated_to = ?rotated_to,
                    "Log file rotated"
                );
                StreamState::RotatedDraining(open)
            }
        }
    }

    fn drain<F: FnMut(LogLine)>(&mut self, mut open: OpenFile, emit: &mut F, summary: &mut PollSummary) {
        summary.rotated = true;
        if let Err(e) = self.read(&mut open, None, emit, summary) {
            self.read_failed(&open, e, summary);
            return;
        }

        if self.pending_bytes > 0 {
            debug!(
                path = ?self.path,
                bytes = self.pending_bytes,
                "Dropping unterminated line from rotated file"
            );
        }
        self.clear_partial();
        self.resume = None;
    }

    fn try_open<F: FnMut(LogLine)>(&mut self, emit: &mut F, summary: &mut PollSummary) -> StreamState {
        let file = match (self.open_file)(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Whatever shows up at the path later was written while watched.
                self.initial = None;
                return StreamState::NoFile;
            }
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Failed to open log file, retrying next poll");
                return StreamState::NoFile;
            }
        };

        let (id, len) = match FileId::from_file(&file).and_then(|id| Ok((id, file.metadata()?.len()))) {
            Ok(v) => v,
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Failed to identify log file, retrying next poll");
                return StreamState::NoFile;
            }
        };

        let start_at = self.initial.take().unwrap_or(StartAt::Beginning);
        let offset = match self.resume.take() {
            Some((resume_id, resume_offset)) if resume_id == id && resume_offset <= len => resume_offset,
            _ => match start_at {
                StartAt::Beginning => 0,
                StartAt::End => len,
            },
        };

        info!(path = ?self.path, file_id = %id, offset, "Opened log file");

        let mut open = OpenFile { file, id, offset };
        match self.read(&mut open, Some(len), emit, summary) {
            Ok(()) => StreamState::Open(open),
            Err(e) => {
                self.read_failed(&open, e, summary);
                StreamState::NoFile
            }
        }
    }

    /// Read from `open.offset` up to `until`, or to EOF when `None`.
    fn read<F: FnMut(LogLine)>(
        &mut self,
        open: &mut OpenFile,
        until: Option<u64>,
        emit: &mut F,
        summary: &mut PollSummary,
    ) -> io::Result<()> {
        if until.is_some_and(|end| end <= open.offset) {
            return Ok(());
        }

        open.file.seek(SeekFrom::Start(open.offset))?;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let want = match until {
                Some(end) => (end - open.offset).min(READ_CHUNK_SIZE as u64) as usize,
                None => READ_CHUNK_SIZE,
            };
            if want == 0 {
                break;
            }

            let n = match open.file.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            open.offset += n as u64;
            summary.lines += self.consume(&buf[..n], emit);
        }

        Ok(())
    }

    /// Split `bytes` on newlines, emitting each completed line.
    fn consume<F: FnMut(LogLine)>(&mut self, mut bytes: &[u8], emit: &mut F) -> usize {
        let mut emitted = 0;
        while !bytes.is_empty() {
            let (segment, complete) = match bytes.iter().position(|&b| b == b'\n') {
                Some(i) => (&bytes[..i], true),
                None => (bytes, false),
            };

            let room = self.max_line_size.saturating_sub(self.partial.len());
            self.partial.extend_from_slice(&segment[..segment.len().min(room)]);
            self.pending_bytes += segment.len() as u64;

            if complete {
                self.pending_bytes += 1;
                let truncated = self.pending_bytes - 1 > self.partial.len() as u64;
                let text = decode_line(&self.partial, truncated);
                emit(LogLine::new(self.path.clone(), text, self.seq));
                self.seq += 1;
                emitted += 1;
                self.clear_partial();
                bytes = &bytes[segment.len() + 1..];
            } else {
                bytes = &[];
            }
        }
        emitted
    }

    fn read_failed(&mut self, open: &OpenFile, e: io::Error, summary: &mut PollSummary) {
        warn!(path = ?self.path, file_id = %open.id, error = %e, "Error reading log file, closing handle");
        summary.read_error = true;
        self.resume = Some((open.id, open.offset.saturating_sub(self.pending_bytes)));
        self.clear_partial();
    }

    fn clear_partial(&mut self) {
        self.partial.clear();
        self.pending_bytes = 0;
    }
}

fn decode_line(bytes: &[u8], truncated: bool) -> String {
    let bytes = if truncated {
        trim_incomplete_char(bytes)
    } else {
        bytes
    };
    String::from_utf8_lossy(bytes).into_owned()
}

/// Drop a multi-byte UTF-8 sequence cut off at the end of `bytes`.
fn trim_incomplete_char(bytes: &[u8]) -> &[u8] {
    let tail_start = bytes.len().saturating_sub(3);
    for i in (tail_start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if bytes.len() - i < width {
            &bytes[..i]
        } else {
            bytes
        };
    }
    bytes
}
