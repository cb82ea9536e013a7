//! # MPSC Channel
//! This crate provides a blocking multi-producer, single-consumer channel for moving values between threads.
//!
//! ## Overview
//! - **Bounded or unbounded**: a bounded channel blocks its senders while the buffer is full (backpressure),
//!   an unbounded one never blocks them.
//! - **Reference counted senders**: `Sender` can be cloned, the channel closes itself once every sender has
//!   been closed or dropped.
//! - **Drain before end**: once closed, the receiver still gets every buffered value before `receive` returns `None`.
//!
//! ## Usage Example
//! ```rust
//! use mpsc_channel::Channel;
//! use std::thread;
//!
//! let (sender, receiver) = Channel::bounded(5);
//!
//! let producer = thread::spawn(move || {
//!     for i in 1..=50u64 {
//!         sender.send(i).unwrap();
//!     }
//!     // dropping the last sender closes the channel
//! });
//!
//! let total: u64 = receiver.iter().map(|v| v * v).sum();
//! producer.join().unwrap();
//! assert_eq!(total, 42925);
//! ```

mod channels;
/// Error types returned by the sending side.
pub mod errors;

pub use channels::{channel, Channel, IntoIter, Iter, Receiver, Sender, TryIter};
pub use errors::{SendError, SendTimeoutError, TrySendError};
