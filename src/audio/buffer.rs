//! Bounded jitter buffer between the capture callback and the pacing loop
//!
//! Frames are queued FIFO up to a fixed capacity. When full, the oldest
//! frame is evicted to admit the new one, so the newest audio always wins.
//! The consumer waits for data with a timeout and can be woken early by a
//! [`CancelToken`].

use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::JITTER_BUFFER_MAX_FRAMES;

/// One capture callback's worth of encoded PCM
pub type AudioFrame = Bytes;

/// Result of a timed dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued {
    /// The oldest buffered frame
    Frame(AudioFrame),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The cancellation signal fired while waiting
    Cancelled,
}

impl Dequeued {
    /// Convert into an optional frame, treating timeout and cancellation alike
    pub fn into_frame(self) -> Option<AudioFrame> {
        match self {
            Dequeued::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Creates a linked cancellation pair.
///
/// Cancelling drops the only sender, which disconnects every clone of the
/// token at once; a blocked `select!` on the token returns immediately.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded::<()>(0);
    (
        CancelHandle { tx: Arc::new(Mutex::new(Some(tx))) },
        CancelToken { rx },
    )
}

/// Owner side of a cancellation signal
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelHandle {
    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Observer side of a cancellation signal
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Bounded drop-oldest FIFO of audio frames
pub struct JitterBuffer {
    frames: Mutex<VecDeque<AudioFrame>>,
    max_frames: usize,
    /// Coalescing readiness signal, at most one pending token
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
    dropped: AtomicUsize,
}

impl JitterBuffer {
    /// Create a buffer holding at most `max_frames` frames
    pub fn new(max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        let (ready_tx, ready_rx) = bounded(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(max_frames)),
            max_frames,
            ready_tx,
            ready_rx,
            dropped: AtomicUsize::new(0),
        }
    }

    /// Copy `data` into the buffer, evicting the oldest frame when full.
    ///
    /// Never blocks beyond the short queue lock.
    pub fn enqueue(&self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    /// Append an already-owned frame, evicting the oldest frame when full
    pub fn push(&self, frame: AudioFrame) {
        {
            let mut frames = self.frames.lock();
            while frames.len() >= self.max_frames {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        // Full channel means a wakeup is already pending.
        let _ = self.ready_tx.try_send(());
    }

    /// Take the oldest frame without waiting
    pub fn try_dequeue(&self) -> Option<AudioFrame> {
        self.frames.lock().pop_front()
    }

    /// Take the oldest frame, waiting up to `timeout` for one to arrive.
    ///
    /// Only one consumer is expected. Cancellation wins over a pending frame
    /// only while waiting; a frame already queued is returned first.
    pub fn dequeue_timeout(&self, timeout: Duration, cancel: &CancelToken) -> Dequeued {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_dequeue() {
                return Dequeued::Frame(frame);
            }
            if cancel.is_cancelled() {
                return Dequeued::Cancelled;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Dequeued::TimedOut;
            }

            select! {
                recv(self.ready_rx) -> _ => continue,
                recv(cancel.receiver()) -> _ => return Dequeued::Cancelled,
                default(remaining) => return Dequeued::TimedOut,
            }
        }
    }

    /// Drop every buffered frame and any pending readiness token
    pub fn clear(&self) {
        let mut frames = self.frames.lock();
        frames.clear();
        while self.ready_rx.try_recv().is_ok() {}
    }

    /// Instantaneous length, for diagnostics only
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    /// Frames evicted by the drop-oldest policy since creation
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.max_frames as f32
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JITTER_BUFFER_MAX_FRAMES)
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;
