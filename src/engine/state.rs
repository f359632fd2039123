//! Window and overflow state shared by the producer and consumer threads.
//!
//! ```text
//!            grant_credit                take_window
//!   Idle ─────────────────► Windowed ─────────────────► Idle
//!    │  ▲                      │
//!    │  │ finish_drain         │ raise_overflow
//!    │  │ (no credit)          ▼
//!    │  └──── Draining ◄─── Overflowing
//!    │           │  begin_drain
//!    │           └──► Windowed (credit pending)
//!    │
//!    └─ complete ──► Complete      fail (from anywhere) ──► Failed
//! ```
//!
//! One mutex guards everything; two condition variables are the only
//! suspension points. The producer waits on `producer_wake` for credit,
//! overflow, completion or failure. The consumer waits on `drain_done`
//! while the producer drains an overflow.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Phase of the segment currently being streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Waiting for credit.
    Idle,
    /// Credit available and not yet taken by the producer.
    Windowed,
    /// Device signalled overflow, producer has not started draining.
    Overflowing,
    /// Producer is draining results.
    Draining,
    /// Device reported `finished_search`.
    Complete,
    /// Run abandoned.
    Failed,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamPhase::Complete | StreamPhase::Failed)
    }
}

#[derive(Debug)]
pub(crate) struct StreamState {
    phase: StreamPhase,
    credit_bytes: u16,
    credit_pending: bool,
}

impl StreamState {
    fn grant_credit(&mut self, bytes: u16) {
        self.credit_bytes = bytes;
        self.credit_pending = true;
        if self.phase == StreamPhase::Idle {
            self.phase = StreamPhase::Windowed;
        }
    }

    fn take_window(&mut self) -> Option<u16> {
        if self.phase != StreamPhase::Windowed {
            return None;
        }
        self.phase = StreamPhase::Idle;
        self.credit_pending = false;
        Some(self.credit_bytes)
    }

    fn raise_overflow(&mut self) -> bool {
        match self.phase {
            StreamPhase::Idle | StreamPhase::Windowed => {
                self.phase = StreamPhase::Overflowing;
                true
            }
            _ => false,
        }
    }

    fn begin_drain(&mut self) -> bool {
        if self.phase != StreamPhase::Overflowing {
            return false;
        }
        self.phase = StreamPhase::Draining;
        true
    }

    fn finish_drain(&mut self) {
        if self.phase == StreamPhase::Draining {
            self.phase =
                if self.credit_pending { StreamPhase::Windowed } else { StreamPhase::Idle };
        }
    }

    fn complete(&mut self) {
        if self.phase != StreamPhase::Failed {
            self.phase = StreamPhase::Complete;
        }
    }
}

/// What woke the producer while it waited for credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowEvent {
    Credit(u16),
    Overflow,
    Complete,
    Failed,
}

/// Why a send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Overflow,
    Failed,
}

/// Shared state of one streamed segment.
#[derive(Debug)]
pub(crate) struct SharedStream {
    state: Mutex<StreamState>,
    producer_wake: Condvar,
    drain_done: Condvar,
}

impl SharedStream {
    /// Start windowed with the credit carried by `send_db`.
    pub(crate) fn new(initial_credit: u16) -> Self {
        Self {
            state: Mutex::new(StreamState {
                phase: StreamPhase::Windowed,
                credit_bytes: initial_credit,
                credit_pending: true,
            }),
            producer_wake: Condvar::new(),
            drain_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        // A panicking thread marks the run failed on its way out
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> StreamPhase {
        self.lock().phase
    }

    // Consumer side

    pub(crate) fn grant_credit(&self, bytes: u16) {
        self.lock().grant_credit(bytes);
        self.producer_wake.notify_one();
    }

    /// Flag overflow, wake the producer and park until its drain finished.
    ///
    /// Returns the phase the consumer wakes up to.
    pub(crate) fn raise_overflow_and_wait(&self) -> StreamPhase {
        let mut state = self.lock();
        if state.raise_overflow() {
            self.producer_wake.notify_one();
        }
        while matches!(state.phase, StreamPhase::Overflowing | StreamPhase::Draining) {
            state = self.drain_done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.phase
    }

    pub(crate) fn complete(&self) {
        self.lock().complete();
        self.producer_wake.notify_one();
    }

    // Either side

    pub(crate) fn fail(&self) {
        self.lock().phase = StreamPhase::Failed;
        self.producer_wake.notify_all();
        self.drain_done.notify_all();
    }

    // Producer side

    /// Block until credit, overflow, completion or failure.
    pub(crate) fn wait_for_window(&self) -> WindowEvent {
        let mut state = self.lock();
        loop {
            match state.phase {
                StreamPhase::Windowed => {
                    if let Some(credit) = state.take_window() {
                        return WindowEvent::Credit(credit);
                    }
                }
                StreamPhase::Overflowing => return WindowEvent::Overflow,
                StreamPhase::Complete => return WindowEvent::Complete,
                StreamPhase::Failed => return WindowEvent::Failed,
                StreamPhase::Idle | StreamPhase::Draining => {}
            }
            state = self.producer_wake.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the device finished searching, ignoring credit.
    pub(crate) fn wait_for_completion(&self) -> WindowEvent {
        let mut state = self.lock();
        loop {
            match state.phase {
                StreamPhase::Overflowing => return WindowEvent::Overflow,
                StreamPhase::Complete => return WindowEvent::Complete,
                StreamPhase::Failed => return WindowEvent::Failed,
                _ => {}
            }
            state = self.producer_wake.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Run `send` unless an overflow or failure is pending.
    ///
    /// The lock is held across `send`, so the consumer cannot flag overflow
    /// between the check and the transmission. Sends are non-blocking.
    pub(crate) fn send_if_clear<R>(&self, send: impl FnOnce() -> R) -> Result<R, Interrupt> {
        let state = self.lock();
        match state.phase {
            StreamPhase::Overflowing => Err(Interrupt::Overflow),
            StreamPhase::Failed => Err(Interrupt::Failed),
            _ => Ok(send()),
        }
    }

    pub(crate) fn begin_drain(&self) -> bool {
        self.lock().begin_drain()
    }

    /// Leave `Draining` and release the parked consumer.
    pub(crate) fn finish_drain(&self) {
        self.lock().finish_drain();
        self.drain_done.notify_all();
    }
}

/// Marks the stream failed if the owning thread unwinds.
pub(crate) struct FailOnPanic<'a>(pub(crate) &'a SharedStream);

impl Drop for FailOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.fail();
        }
    }
}
