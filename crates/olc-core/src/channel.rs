//! Bit-addressed wait channel and the queues bound to it.
//!
//! # Architecture
//!
//! ```text
//!  producer ──push──► BitQueue (crossbeam bounded) ──signal(bit)──► WaitChannel
//!                                                                     │
//!  container thread ◄──────────── wait(mask) / take(mask) ────────────┘
//! ```
//!
//! A [`WaitChannel`] holds a latched set of signalled bits. Pushing to a
//! [`BitQueue`] sets the queue's bit; the container thread blocks on (or
//! polls) the channel with its current listen mask and gets back the ready
//! bits, which are cleared as they are returned. Bits outside the mask stay
//! latched until the mask includes them again.
//!
//! Several queues may share one bit (a port's data queue and its satellite
//! event queue do): the handler for the bit drains both.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};

/// Latched bit set with blocking wait.
#[derive(Default)]
pub struct WaitChannel {
    signalled: Mutex<u32>,
    cond: Condvar,
}

impl fmt::Debug for WaitChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitChannel")
            .field("signalled", &format_args!("0x{:08X}", *self.signalled.lock()))
            .finish()
    }
}

impl WaitChannel {
    /// Creates an empty channel, shared by reference count.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets `bits` and wakes any waiter.
    pub fn signal(&self, bits: u32) {
        let mut signalled = self.signalled.lock();
        *signalled |= bits;
        self.cond.notify_all();
    }

    /// Blocks until any bit in `mask` is set, then clears and returns the
    /// ready bits.
    ///
    /// A zero mask would block forever; it returns 0 immediately instead.
    pub fn wait(&self, mask: u32) -> u32 {
        if mask == 0 {
            return 0;
        }
        let mut signalled = self.signalled.lock();
        while *signalled & mask == 0 {
            self.cond.wait(&mut signalled);
        }
        let ready = *signalled & mask;
        *signalled &= !ready;
        ready
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout` and returns 0.
    pub fn wait_timeout(&self, mask: u32, timeout: Duration) -> u32 {
        let mut signalled = self.signalled.lock();
        if *signalled & mask == 0 {
            let _ = self
                .cond
                .wait_while_for(&mut signalled, |s| *s & mask == 0, timeout);
        }
        let ready = *signalled & mask;
        *signalled &= !ready;
        ready
    }

    /// Clears and returns the ready bits in `mask` without blocking.
    pub fn take(&self, mask: u32) -> u32 {
        let mut signalled = self.signalled.lock();
        let ready = *signalled & mask;
        *signalled &= !ready;
        ready
    }

    /// Returns the ready bits in `mask` without clearing them.
    pub fn poll(&self, mask: u32) -> u32 {
        *self.signalled.lock() & mask
    }

    /// Clears `bits` without reporting them.
    pub fn clear(&self, bits: u32) {
        *self.signalled.lock() &= !bits;
    }
}

/// Reason a push was refused. The message is handed back.
pub enum QueueError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The receiving side has been dropped.
    Closed(T),
}

impl<T> QueueError<T> {
    /// Recovers the refused message.
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Full(msg) | QueueError::Closed(msg) => msg,
        }
    }
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full(_) => f.write_str("Full(..)"),
            QueueError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full(_) => write!(f, "queue is full"),
            QueueError::Closed(_) => write!(f, "queue is closed"),
        }
    }
}

impl<T> std::error::Error for QueueError<T> {}

/// Producer side of a [`BitQueue`]. Cheap to clone.
pub struct QueueHandle<T> {
    tx: Sender<T>,
    bit: u32,
    channel: Arc<WaitChannel>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            bit: self.bit,
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T> fmt::Debug for QueueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("bit", &format_args!("0x{:08X}", self.bit))
            .field("len", &self.tx.len())
            .finish()
    }
}

impl<T> QueueHandle<T> {
    /// Pushes without blocking and signals the queue's bit.
    pub fn push(&self, msg: T) -> Result<(), QueueError<T>> {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.channel.signal(self.bit);
                Ok(())
            }
            Err(TrySendError::Full(msg)) => Err(QueueError::Full(msg)),
            Err(TrySendError::Disconnected(msg)) => Err(QueueError::Closed(msg)),
        }
    }

    /// Bit signalled on push.
    #[inline]
    pub fn bit(&self) -> u32 {
        self.bit
    }
}

/// Bounded FIFO bound to one channel bit.
pub struct BitQueue<T> {
    name: String,
    capacity: usize,
    handle: QueueHandle<T>,
    rx: Receiver<T>,
}

impl<T> fmt::Debug for BitQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitQueue")
            .field("name", &self.name)
            .field("bit", &format_args!("0x{:08X}", self.handle.bit))
            .field("len", &self.rx.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> BitQueue<T> {
    /// Creates a queue of `capacity` elements that signals `bit` on
    /// `channel` whenever a message is pushed.
    pub fn new(name: impl Into<String>, capacity: usize, bit: u32, channel: &Arc<WaitChannel>) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            name: name.into(),
            capacity,
            handle: QueueHandle {
                tx,
                bit,
                channel: Arc::clone(channel),
            },
            rx,
        }
    }

    /// Producer handle for other threads or peers.
    pub fn handle(&self) -> QueueHandle<T> {
        self.handle.clone()
    }

    /// Pushes from the owning side.
    pub fn push(&self, msg: T) -> Result<(), QueueError<T>> {
        self.handle.push(msg)
    }

    /// Pops the front message, if any.
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Pops everything currently queued.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        self.rx.try_iter()
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound channel bit.
    #[inline]
    pub fn bit(&self) -> u32 {
        self.handle.bit
    }

    /// Messages currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued messages.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
