// SPDX-License-Identifier: Apache-2.0

//! Bounded hand-off channels for the tailing engine.
//!
//! Thin wrapper over flume bounded channels exposing the blocking operations
//! the scheduler relies on: pushing to a full channel blocks the pusher,
//! popping an empty channel blocks the popper. All consumers run on dedicated
//! OS threads, so there is no async surface here.

use std::fmt;
use std::time::Duration;

use flume::{Receiver, Sender};

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

/// Error returned by [`BoundedSender::send_timeout`], carrying the item back
/// so the caller can retry.
#[derive(Debug)]
pub enum SendTimeoutError<T> {
    Timeout(T),
    Disconnected(T),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl<T> BoundedSender<T> {
    /// Blocking send - blocks until there is capacity in the channel.
    pub fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send(item) {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Send with a deadline. On timeout the item is handed back so the caller
    /// can check a shutdown flag and retry.
    pub fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => Ok(()),
            Err(flume::SendTimeoutError::Timeout(item)) => Err(SendTimeoutError::Timeout(item)),
            Err(flume::SendTimeoutError::Disconnected(item)) => {
                Err(SendTimeoutError::Disconnected(item))
            }
        }
    }

    /// Non-blocking send - fails immediately when the channel is full.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(item)) => Err(item),
            Err(flume::TrySendError::Disconnected(item)) => Err(item),
        }
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

impl<T> Clone for BoundedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> BoundedReceiver<T> {
    /// Blocking receive - blocks until an item is available.
    /// Returns None once every sender is gone.
    pub fn recv(&self) -> Option<T> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Blocking receive with timeout.
    /// Returns None if the timeout expires or the channel is disconnected.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking receive - returns immediately.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
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

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}
