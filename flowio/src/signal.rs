//! Signal Hub
//!
//! Typed, per-stream signal delivery. A stream owns one hub; observers call
//! `subscribe()` and receive every signal emitted afterwards on their own
//! unbounded channel.
//!
//! # Delivery rules
//!
//! - Signals are delivered in emission order to every live subscriber.
//! - A subscriber that dropped its receiver is removed on the next emit.
//! - `emit_terminal` delivers the signal and then closes the hub: all
//!   receivers observe `None` after the terminal signal, later emits are
//!   ignored, and late subscribers get an already-closed receiver.
//!
//! How often each signal fires (`drain` once per crossing, `finish` once,
//! and so on) is enforced by the owning stream, not by the hub.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::idgen::Handle;

/// Signals emitted by a `Readable`
#[derive(Debug, Clone)]
pub enum ReadableEvent {
    /// A chunk was handed to the consumer
    Data(Bytes),
    /// The source is exhausted and every chunk was consumed
    End,
    /// Terminal failure
    Error(StreamError),
}

/// Signals emitted by a `Writable`
#[derive(Debug, Clone)]
pub enum WritableEvent {
    /// The buffered length fell back below the watermark
    Drain,
    /// All data was flushed and the sink released
    Finish,
    /// Terminal failure
    Error(StreamError),
}

struct Subscriber<E> {
    sender: mpsc::UnboundedSender<E>,
    debug_hint: String,
}

struct HubState<E> {
    subscribers: Vec<Subscriber<E>>,
    closed: bool,
}

/// Fan-out of stream signals to subscribed receivers
pub struct SignalHub<E> {
    handle: Handle,
    state: Mutex<HubState<E>>,
}

impl<E: Clone + std::fmt::Debug> SignalHub<E> {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            state: Mutex::new(HubState {
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Subscribe to signals emitted from now on
    ///
    /// Drop the receiver to unsubscribe.
    pub fn subscribe(&self, debug_hint: &str) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if state.closed {
            log::debug!(
                "signal.subscribe: stream {} already closed (hint: {debug_hint})",
                self.handle
            );
            // tx is dropped here, so the receiver reports closed immediately
            return rx;
        }
        state.subscribers.push(Subscriber {
            sender: tx,
            debug_hint: debug_hint.to_string(),
        });
        rx
    }

    /// Deliver a signal to every live subscriber
    pub fn emit(&self, signal: E) {
        let mut state = self.state.lock();
        if state.closed {
            log::trace!(
                "signal.emit: stream {} closed, dropping {signal:?}",
                self.handle
            );
            return;
        }

        log::debug!(
            "signal.emit: stream {}, signal={signal:?}, subscribers: {}",
            self.handle,
            state.subscribers.len()
        );

        let handle = self.handle;
        state.subscribers.retain(|sub| {
            if sub.sender.send(signal.clone()).is_ok() {
                true
            } else {
                log::debug!(
                    "signal.emit: receiver dropped for stream {handle} (hint: {})",
                    sub.debug_hint
                );
                false
            }
        });
    }

    /// Deliver a final signal and close the hub
    pub fn emit_terminal(&self, signal: E) {
        self.emit(signal);
        self.close();
    }

    /// Close the hub; receivers see the end of their channel
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl<E> std::fmt::Debug for SignalHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SignalHub")
            .field("handle", &self.handle)
            .field("subscribers", &state.subscribers.len())
            .field("closed", &state.closed)
            .finish()
    }
}
