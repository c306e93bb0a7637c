use alloc::collections::BinaryHeap;
use alloc::rc::Rc;
use core::cell::Cell;
use core::cmp::{Ordering, Reverse};
use core::fmt;

use super::SocketHandle;
use crate::time::Instant;

/// The three timers a connection can have armed.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum TimerKind {
    /// Retransmission (and connection attempt) timeout.
    Retransmit,
    /// Delayed acknowledgement.
    DelayedAck,
    /// Wait for the final acknowledgement in LAST-ACK.
    LastAck,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TimerKind::Retransmit => write!(f, "retransmit"),
            TimerKind::DelayedAck => write!(f, "delayed-ack"),
            TimerKind::LastAck => write!(f, "last-ack"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum TimerState {
    Pending,
    Cancelled,
    Fired,
}

/// A reference to one scheduled expiry.
///
/// Cancelling is idempotent: cancelling twice, or cancelling a timer that has
/// already fired, does nothing.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Rc<Cell<TimerState>>,
    expires_at: Instant,
}

impl TimerHandle {
    /// Query whether the timer is still waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.state.get() == TimerState::Pending
    }

    /// Query whether the timer has fired or was cancelled.
    pub fn is_expired(&self) -> bool {
        !self.is_pending()
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Prevent the timer from firing.
    pub fn cancel(&self) {
        if self.state.get() == TimerState::Pending {
            self.state.set(TimerState::Cancelled);
        }
    }
}

#[derive(Debug)]
struct Entry {
    expires_at: Instant,
    order: u64,
    socket: SocketHandle,
    kind: TimerKind,
    state: Rc<Cell<TimerState>>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        (self.expires_at, self.order).cmp(&(other.expires_at, other.order))
    }
}

/// Pending expiries of every socket on an interface, earliest first.
///
/// Timers scheduled for the same instant fire in the order they were scheduled.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_order: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    /// Arrange for `kind` to fire on `socket` at `expires_at`.
    pub fn schedule(
        &mut self,
        socket: SocketHandle,
        kind: TimerKind,
        expires_at: Instant,
    ) -> TimerHandle {
        let state = Rc::new(Cell::new(TimerState::Pending));
        self.heap.push(Reverse(Entry {
            expires_at,
            order: self.next_order,
            socket,
            kind,
            state: state.clone(),
        }));
        self.next_order += 1;
        net_trace!("timer: {} for {} at {}", kind, socket, expires_at);
        TimerHandle { state, expires_at }
    }

    /// Remove and return the earliest live timer due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(SocketHandle, TimerKind)> {
        self.purge();
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.expires_at <= now => (),
            _ => return None,
        }
        let Reverse(entry) = self.heap.pop()?;
        entry.state.set(TimerState::Fired);
        Some((entry.socket, entry.kind))
    }

    /// The instant the earliest live timer expires at.
    pub fn poll_at(&mut self) -> Option<Instant> {
        self.purge();
        self.heap.peek().map(|Reverse(entry)| entry.expires_at)
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.heap
            .iter()
            .filter(|Reverse(entry)| entry.state.get() == TimerState::Pending)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.state.get() == TimerState::Pending {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const A: SocketHandle = SocketHandle(0);
    const B: SocketHandle = SocketHandle(1);

    #[test]
    fn test_fires_in_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(A, TimerKind::Retransmit, Instant::from_millis(30));
        queue.schedule(B, TimerKind::DelayedAck, Instant::from_millis(10));
        queue.schedule(A, TimerKind::LastAck, Instant::from_millis(10));

        assert_eq!(queue.poll_at(), Some(Instant::from_millis(10)));
        assert_eq!(queue.pop_due(Instant::from_millis(5)), None);
        assert_eq!(
            queue.pop_due(Instant::from_millis(10)),
            Some((B, TimerKind::DelayedAck))
        );
        assert_eq!(
            queue.pop_due(Instant::from_millis(10)),
            Some((A, TimerKind::LastAck))
        );
        assert_eq!(queue.pop_due(Instant::from_millis(10)), None);
        assert_eq!(
            queue.pop_due(Instant::from_millis(100)),
            Some((A, TimerKind::Retransmit))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut queue = TimerQueue::new();
        let handle = queue.schedule(A, TimerKind::Retransmit, Instant::from_millis(10));
        assert!(handle.is_pending());
        handle.cancel();
        assert!(!handle.is_pending());
        assert_eq!(queue.poll_at(), None);
        assert_eq!(queue.pop_due(Instant::from_millis(100)), None);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut queue = TimerQueue::new();
        let handle = queue.schedule(A, TimerKind::Retransmit, Instant::from_millis(10));
        handle.cancel();
        handle.cancel();
        assert!(handle.is_expired());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_cancel_after_fire() {
        let mut queue = TimerQueue::new();
        let handle = queue.schedule(A, TimerKind::DelayedAck, Instant::from_millis(10));
        assert_eq!(
            queue.pop_due(Instant::from_millis(10)),
            Some((A, TimerKind::DelayedAck))
        );
        assert!(handle.is_expired());
        handle.cancel();
        assert_eq!(queue.pop_due(Instant::from_millis(20)), None);
    }
}
