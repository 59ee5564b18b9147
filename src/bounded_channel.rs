// SPDX-License-Identifier: Apache-2.0

//! Bounded MPMC channel shared by the tailer threads and the async dispatcher.
//!
//! Producers on plain OS threads use the blocking calls, the dispatcher tasks
//! use the async ones. A full channel applies backpressure to the producer.

use flume::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::time::Duration;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| SendError::Disconnected) // receiver closed
    }

    /// Blocking send - waits for capacity in the channel.
    /// Use this from non-async contexts (e.g. the stream worker threads).
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        self.tx.send(item).map_err(|_| SendError::Disconnected)
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_disconnected()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Returns `None` once every sender is dropped and the channel is drained.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive with a timeout. `None` on timeout or disconnect.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    (BoundedSender { tx }, BoundedReceiver { rx })
}
