//! The bounded command queue the session engine drains one entry at a
//! time.
//!
//! Grounded on the `mpsc` command/response channel pair in
//! `kwp2000/mod.rs::Kwp2000DiagnosticServer`, generalized from KWP's single
//! always-one-in-flight channel to an explicit bounded FIFO so enqueue can
//! fail fast with [`DiagError::QueueFull`] instead of blocking (§4.6).

use crate::DiagError;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Default queue capacity (§4.6).
pub const DEFAULT_CAPACITY: usize = 10;

/// One queued request: its wire-ready command text, absolute deadline, and
/// single-assignment completion channel.
#[derive(Debug)]
pub struct QueuedCommand {
    /// ASCII command text, without the trailing `\r` (added at send time).
    pub command: String,
    /// When this entry was enqueued.
    pub enqueued_at: Instant,
    /// Absolute point in time after which this command is considered
    /// timed out.
    pub deadline_at: Instant,
    completion: mpsc::Sender<Result<Vec<u8>, DiagError>>,
}

impl QueuedCommand {
    /// `true` if `deadline_at` has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline_at
    }

    /// Fulfills this command's completion slot. Since the slot is
    /// single-assignment, a second call is a silent no-op (the receiver
    /// has already been answered or has gone away).
    pub fn complete(self, result: Result<Vec<u8>, DiagError>) {
        let _ = self.completion.send(result);
    }
}

/// A bounded FIFO of [`QueuedCommand`]s, owned by the session engine.
#[derive(Debug)]
pub struct CommandQueue {
    entries: VecDeque<QueuedCommand>,
    capacity: usize,
}

impl CommandQueue {
    /// Creates an empty queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Enqueues `command` with the given per-command `timeout`, returning
    /// the receiving half of its completion channel. Fails with
    /// [`DiagError::QueueFull`] once the queue is at capacity, rather than
    /// blocking.
    pub fn enqueue(
        &mut self,
        command: String,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Result<Vec<u8>, DiagError>>, DiagError> {
        if self.entries.len() >= self.capacity {
            return Err(DiagError::QueueFull);
        }
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        self.entries.push_back(QueuedCommand {
            command,
            enqueued_at: now,
            deadline_at: now + timeout,
            completion: tx,
        });
        Ok(rx)
    }

    /// Removes and returns the next command to send, in FIFO order.
    pub fn dequeue(&mut self) -> Option<QueuedCommand> {
        self.entries.pop_front()
    }

    /// Completes every still-queued command with `DiagError::ConnectionClosed`
    /// and empties the queue. Used on transport failure or session shutdown
    /// so no pending entry is ever silently dropped (§4.6).
    pub fn fail_all_connection_closed(&mut self) {
        for entry in self.entries.drain(..) {
            entry.complete(Err(DiagError::ConnectionClosed));
        }
    }

    /// Number of commands currently queued (excludes the one, if any, the
    /// session engine has already dequeued and is awaiting a response for).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no commands are queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_beyond_capacity_fails_fast() {
        let mut q = CommandQueue::new(10);
        for i in 0..10 {
            q.enqueue(format!("cmd{}", i), Duration::from_secs(2)).unwrap();
        }
        assert!(matches!(
            q.enqueue("overflow".into(), Duration::from_secs(2)),
            Err(DiagError::QueueFull)
        ));
    }

    #[test]
    fn dequeue_is_fifo() {
        let mut q = CommandQueue::new(10);
        q.enqueue("first".into(), Duration::from_secs(2)).unwrap();
        q.enqueue("second".into(), Duration::from_secs(2)).unwrap();
        assert_eq!(q.dequeue().unwrap().command, "first");
        assert_eq!(q.dequeue().unwrap().command, "second");
    }

    #[test]
    fn fail_all_resolves_every_pending_entry_once() {
        let mut q = CommandQueue::new(10);
        let rx1 = q.enqueue("a".into(), Duration::from_secs(2)).unwrap();
        let rx2 = q.enqueue("b".into(), Duration::from_secs(2)).unwrap();
        q.fail_all_connection_closed();
        assert!(matches!(rx1.recv().unwrap(), Err(DiagError::ConnectionClosed)));
        assert!(matches!(rx2.recv().unwrap(), Err(DiagError::ConnectionClosed)));
        assert!(q.is_empty());
    }
}
