use crate::errors::{SendError, SendTimeoutError, TrySendError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use sync_tools::{CondvarExt, LockExt};
use tracing::trace;

/// Creates a channel and returns its two endpoints. `None` gives an unbounded channel, `Some(n)` a
/// channel holding at most `n` buffered values (a capacity of `0` is rounded up to `1`).
pub fn channel<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    let core = Arc::new(ChannelCore::new(capacity.map(|cap| cap.max(1))));
    (
        Sender {
            core: Arc::clone(&core),
            released: AtomicBool::new(false),
        },
        Receiver { core },
    )
}

/// Namespace for the channel constructors.
pub struct Channel;

impl Channel {
    /// Same as [`channel`].
    pub fn new<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
        channel(capacity)
    }

    /// A channel whose `send` never blocks.
    pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
        channel(None)
    }

    /// A channel whose `send` blocks while `capacity` values are buffered.
    pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        channel(Some(capacity))
    }
}

struct CoreState<T> {
    queue: VecDeque<T>,
    closed: bool,
    senders: usize,
}

/// The state shared by every endpoint of a channel. Senders wait on `not_full`, receivers on
/// `not_empty`; closing the channel wakes both sides.
struct ChannelCore<T> {
    capacity: Option<usize>,
    state: Mutex<CoreState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> ChannelCore<T> {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            state: Mutex::new(CoreState {
                queue: VecDeque::new(),
                closed: false,
                senders: 1,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn is_full(&self, state: &CoreState<T>) -> bool {
        self.capacity.is_some_and(|cap| state.queue.len() >= cap)
    }

    /// Pushes `value`, blocking while the buffer is full. Without a deadline the only failure is a closed channel.
    fn push(&self, value: T, deadline: Option<Instant>) -> Result<(), SendTimeoutError<T>> {
        let mut state = self.state.locked();
        loop {
            if state.closed {
                return Err(SendTimeoutError::Closed(value));
            }
            if !self.is_full(&state) {
                state.queue.push_back(value);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = match deadline {
                None => self.not_full.wait_on(state),
                Some(deadline) => {
                    let (state, expired) = self.not_full.wait_until(state, deadline);
                    if expired && !state.closed && self.is_full(&state) {
                        return Err(SendTimeoutError::Timeout(value));
                    }
                    state
                }
            };
        }
    }

    fn try_push(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.state.locked();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if self.is_full(&state) {
            return Err(TrySendError::Full(value));
        }
        state.queue.push_back(value);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pops the oldest value, blocking while the buffer is empty and the channel open.
    fn pop(&self, deadline: Option<Instant>) -> Option<T> {
        let mut state = self.state.locked();
        loop {
            if let Some(value) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(value);
            }
            if state.closed {
                return None;
            }
            state = match deadline {
                None => self.not_empty.wait_on(state),
                Some(deadline) => {
                    let (state, expired) = self.not_empty.wait_until(state, deadline);
                    if expired && state.queue.is_empty() {
                        return None;
                    }
                    state
                }
            };
        }
    }

    fn try_pop(&self) -> Option<T> {
        let value = self.state.locked().queue.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Marks the channel closed and wakes every waiter. Returns `false` if it was already closed.
    fn close(&self) -> bool {
        let mut state = self.state.locked();
        if state.closed {
            return false;
        }
        state.closed = true;
        let buffered = state.queue.len();
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
        trace!(buffered, "channel closed");
        true
    }

    fn acquire_sender(&self) {
        self.state.locked().senders += 1;
    }

    /// Drops one sender share; the last one closes the channel.
    fn release_sender(&self) {
        let mut state = self.state.locked();
        state.senders = state.senders.saturating_sub(1);
        if state.senders == 0 {
            drop(state);
            self.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.locked().closed
    }

    fn len(&self) -> usize {
        self.state.locked().queue.len()
    }

    fn sender_count(&self) -> usize {
        self.state.locked().senders
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// The producing side of a channel. Senders can be cloned freely; every clone holds one share of
/// the channel and the channel closes itself once the last share is released, either by `close`
/// or by dropping the sender.
pub struct Sender<T> {
    core: Arc<ChannelCore<T>>,
    released: AtomicBool,
}

impl<T> Sender<T> {
    /// Sends a value, blocking while a bounded channel is full.
    /// Fails, giving the value back, if the channel is closed (or closes while waiting) or if this sender was closed.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        if self.released.load(Ordering::Acquire) {
            return Err(SendError(value));
        }
        self.core
            .push(value, None)
            .map_err(|e| SendError(e.into_inner()))
    }

    /// Sends a value without blocking. Returns `TrySendError::Full` if the buffer is full and `TrySendError::Closed` if the channel is closed.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.released.load(Ordering::Acquire) {
            return Err(SendError(value).into());
        }
        self.core.try_push(value)
    }

    /// Like `send`, but gives up once the buffer stayed full for `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        if self.released.load(Ordering::Acquire) {
            return Err(SendError(value).into());
        }
        self.core.push(value, deadline_after(timeout))
    }

    /// Releases the share of this sender. The channel stays open while other senders are alive.
    /// Calling it more than once has no effect. Once closed, this sender can no longer send.
    pub fn close(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.core.release_sender();
        }
    }

    /// Closes the whole channel right away, for every sender and the receiver.
    pub fn close_channel(&self) {
        self.core.close();
    }

    /// Returns `true` if this sender was closed or if the channel itself is closed.
    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.core.is_closed()
    }

    /// Returns the capacity of the channel, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.core.capacity
    }

    /// Returns the number of senders still holding a share of the channel.
    pub fn sender_count(&self) -> usize {
        self.core.sender_count()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.core.acquire_sender();
        Self {
            core: Arc::clone(&self.core),
            released: AtomicBool::new(false),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.core.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The consuming side of a channel. There is exactly one receiver per channel; all of its methods
/// take `&self`, so it can be shared behind an `Arc` by several consumers.
pub struct Receiver<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Receiver<T> {
    /// Receives the oldest value, blocking while the channel is empty and open.
    /// Returns `None` once the channel is closed and every buffered value has been received.
    pub fn receive(&self) -> Option<T> {
        self.core.pop(None)
    }

    /// Receives a value without blocking. Returns `None` if nothing is buffered, closed or not.
    pub fn try_receive(&self) -> Option<T> {
        self.core.try_pop()
    }

    /// Waits up to `timeout` for a value. Returns `None` on timeout or when the channel is closed and empty.
    pub fn receive_timeout(&self, timeout: Duration) -> Option<T> {
        self.core.pop(deadline_after(timeout))
    }

    /// Closes the channel right away, regardless of the senders still alive. Blocked senders fail,
    /// values already buffered can still be received. Calling it more than once has no effect.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn is_empty(&self) -> bool {
        self.core.len() == 0
    }

    /// Returns the number of buffered values.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns the capacity of the channel, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.core.capacity
    }

    /// Returns a blocking iterator that ends when `receive` returns `None`.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { receiver: self }
    }

    /// Returns an iterator over the values buffered right now, it never blocks.
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { receiver: self }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.core.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct Iter<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.receive()
    }
}

pub struct TryIter<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<T> Iterator for TryIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.try_receive()
    }
}

pub struct IntoIter<T> {
    receiver: Receiver<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.receive()
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

impl<T> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { receiver: self }
    }
}
