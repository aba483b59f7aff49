// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single-outstanding request slot with a blocking, timeout-bounded wait.
//!
//! Task management and internal commands each own one. Issuers hold the
//! serialization lock for the whole operation; the reply handler and the IOC
//! reset hook only touch the state.

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::time::Duration;

enum SlotState<R> {
    Idle,
    Pending,
    Completed(Option<R>),
    IocReset,
}

/// How a wait on the slot ended.
#[derive(Debug)]
pub enum WaitOutcome<R> {
    /// The reply handler ran. `None` if the IOC completed the request
    /// without a reply frame.
    Completed(Option<R>),
    /// An IOC reset terminated the request.
    IocReset,
    TimedOut,
}

pub struct MgmtSlot<R> {
    serialize: Mutex<()>,
    state: Mutex<SlotState<R>>,
    done: Condvar,
}

impl<R> MgmtSlot<R> {
    pub fn new() -> Self {
        Self {
            serialize: Mutex::new(()),
            state: Mutex::new(SlotState::Idle),
            done: Condvar::new(),
        }
    }

    /// Takes the slot for one request.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.serialize.lock()
    }

    /// Marks a request as outstanding. Call before posting the frame.
    pub fn arm(&self, _guard: &MutexGuard<'_, ()>) {
        *self.state.lock() = SlotState::Pending;
    }

    /// Disarms the slot without waiting, for a request that never reached
    /// the IOC.
    pub fn disarm(&self, _guard: &MutexGuard<'_, ()>) {
        *self.state.lock() = SlotState::Idle;
    }

    /// Records the reply. Returns false if nobody is waiting, in which case
    /// the waiter has already given up on the request and owns its frame.
    pub fn complete(&self, reply: Option<R>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Completed(reply);
        self.done.notify_all();
        true
    }

    /// Wakes the waiter because the IOC was reset. Returns whether anybody
    /// was waiting.
    pub fn ioc_reset(&self) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::IocReset;
        self.done.notify_all();
        true
    }

    /// Waits for the outstanding request. The slot is idle afterwards, so a
    /// reply arriving after a timeout is not mistaken for a later request's.
    pub fn wait(&self, _guard: &MutexGuard<'_, ()>, timeout: Duration) -> WaitOutcome<R> {
        let mut state = self.state.lock();
        self.done.wait_while_for(
            &mut state,
            |state| matches!(state, SlotState::Pending),
            timeout,
        );
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Completed(reply) => WaitOutcome::Completed(reply),
            SlotState::IocReset => WaitOutcome::IocReset,
            SlotState::Pending | SlotState::Idle => WaitOutcome::TimedOut,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Pending)
    }
}

impl<R> Default for MgmtSlot<R> {
    fn default() -> Self {
        Self::new()
    }
}
