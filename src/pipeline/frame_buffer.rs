//! Single-slot holder for the most recent stream frame
//!
//! One producer overwrites the slot, any number of consumers wait for a
//! frame newer than the one they last saw. Consumers that fall behind skip
//! straight to the latest frame; this is not a queue.
//!
//! Every stream start opens a new generation and every stop closes it.
//! Waiters of a closed generation are released with [`Next::Ended`], so a
//! consumer never outlives the stream it attached to.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::capture::Frame;

#[derive(Default)]
pub struct FrameBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
}

#[derive(Default)]
struct BufferState {
    latest: Option<Frame>,
    /// Sequence number of the last accepted frame
    sequence: u64,
    generation: u64,
    live: bool,
}

/// A consumer's position in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    generation: u64,
    last_seen: u64,
}

impl Cursor {
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}

/// Outcome of [`FrameBuffer::wait_for_next`]
#[derive(Debug, Clone)]
pub enum Next {
    Frame(Frame),
    /// The stream this cursor belongs to has stopped
    Ended,
    TimedOut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new generation
    pub(crate) fn open(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.live = true;
        state.latest = None;
    }

    /// End the current generation and release every waiter
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if state.live {
            state.live = false;
            state.latest = None;
            drop(state);
            self.ready.notify_all();
        }
    }

    pub fn is_live(&self) -> bool {
        self.lock().live
    }

    /// Sequence number of the most recently published frame, 0 if none
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Replace the held frame and wake every waiter. Never blocks on
    /// consumers.
    ///
    /// Frames are rejected when no stream is live or when the sequence
    /// number does not advance.
    pub fn publish(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if !state.live {
            return false;
        }
        if frame.sequence <= state.sequence {
            warn!(
                "Dropping frame {} published after {}",
                frame.sequence, state.sequence
            );
            return false;
        }
        state.sequence = frame.sequence;
        state.latest = Some(frame);
        drop(state);
        self.ready.notify_all();
        true
    }

    /// Cursor for a consumer attaching to the current generation
    pub fn cursor(&self) -> Cursor {
        Cursor {
            generation: self.lock().generation,
            last_seen: 0,
        }
    }

    /// Block until a frame newer than `cursor.last_seen()` is available, the
    /// cursor's stream ends, or `timeout` passes.
    ///
    /// The buffer lock is released before returning; the frame handed out is
    /// a cheap clone of the held one.
    pub fn wait_for_next(&self, cursor: &mut Cursor, timeout: Duration) -> Next {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.live || state.generation != cursor.generation {
                return Next::Ended;
            }
            if let Some(frame) = state
                .latest
                .as_ref()
                .filter(|f| f.sequence > cursor.last_seen)
            {
                cursor.last_seen = frame.sequence;
                return Next::Frame(frame.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Next::TimedOut;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
