//! Pure frame parsing and edge detection for the consumer side.
//!
//! Nothing in here touches a socket: the link feeds raw bytes into a
//! [`FrameDecoder`], passes every parsed [`Record`] to an [`EdgeDetector`],
//! and records rising edges in a [`MotionLatch`] that the consumer polls.

use crate::protocol::{PirState, Record};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Why a frame was discarded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame exceeds {limit} bytes ({len} buffered)")]
    Oversized { len: usize, limit: usize },
}

/// Splits a byte stream into newline-delimited records.
///
/// A bad frame only costs that frame: parsing resumes after the next `\n`.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
    /// Set while skipping the remainder of an oversized frame.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            max_frame_len,
            discarding: false,
        }
    }

    /// Append raw bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Result<Record, FrameError>> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                return self.check_overflow();
            };

            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_frame_len {
                return Some(Err(FrameError::Oversized {
                    len: line.len(),
                    limit: self.max_frame_len,
                }));
            }

            return Some(serde_json::from_slice(line).map_err(FrameError::from));
        }
    }

    /// Drain every complete frame currently buffered.
    pub fn frames(&mut self) -> impl Iterator<Item = Result<Record, FrameError>> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    fn check_overflow(&mut self) -> Option<Result<Record, FrameError>> {
        if self.buffer.len() <= self.max_frame_len {
            return None;
        }
        let len = self.buffer.len();
        self.buffer.clear();
        if std::mem::replace(&mut self.discarding, true) {
            None
        } else {
            Some(Err(FrameError::Oversized {
                len,
                limit: self.max_frame_len,
            }))
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

/// A 0 -> 1 transition observed in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RisingEdge {
    /// The server's running motion counter carried by the triggering record.
    pub motion_count: u64,
}

/// Tracks the previous state and reports rising edges.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    previous: PirState,
}

impl EdgeDetector {
    pub fn previous(&self) -> PirState {
        self.previous
    }

    /// Feed one record. Welcome records only seed the previous state.
    pub fn observe(&mut self, record: &Record) -> Option<RisingEdge> {
        match record {
            Record::Welcome(welcome) => {
                self.previous = welcome.pir_state;
                None
            }
            Record::State(state) => {
                let edge = (self.previous == PirState::Idle && state.state == PirState::Motion)
                    .then_some(RisingEdge {
                        motion_count: state.motion_count,
                    });
                self.previous = state.state;
                edge
            }
        }
    }
}

/// Pending-motion flag and its timestamp, always updated together.
///
/// Debouncing is delay-before-report: a pending edge is only handed out
/// once more than the debounce window has passed since it was latched.
#[derive(Debug, Default, Clone, Copy)]
pub struct MotionLatch {
    pending: bool,
    last_motion: Option<Instant>,
}

impl MotionLatch {
    pub fn set(&mut self, at: Instant) {
        self.pending = true;
        self.last_motion = Some(at);
    }

    /// Consume the pending edge if it is older than `debounce`.
    pub fn take_debounced(&mut self, now: Instant, debounce: Duration) -> bool {
        match self.last_motion {
            Some(at) if self.pending && now.saturating_duration_since(at) > debounce => {
                self.pending = false;
                true
            }
            _ => false,
        }
    }

    /// Drop a pending edge without reporting it. The timestamp is kept.
    pub fn clear(&mut self) {
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_motion(&self) -> Option<Instant> {
        self.last_motion
    }

    /// True while an edge is pending or the latest edge is younger than `window`.
    pub fn active_within(&self, now: Instant, window: Duration) -> bool {
        self.pending
            || self
                .last_motion
                .is_some_and(|at| now.saturating_duration_since(at) < window)
    }
}
