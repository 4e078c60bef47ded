//! Deferred priority task.
//!
//! Housekeeping that must not queue behind application traffic is requested
//! by setting a priority bit in the device state.  While any priority bit is
//! set, ordinary submissions are refused with [`Error::Busy`], and the
//! platform is asked to run [`Device::run_priority_task`] from a deferred,
//! non-blocking context.
//!
//! Each run issues the highest priority pending task:
//!
//! 1. [`StateFlags::CLEAR_POINTER`] - free the quiet reply buffer
//! 2. [`StateFlags::RELAY_SESSION_CMD`] - send the queued session command
//! 3. [`StateFlags::SEND_GRANT`] - tell the card how far the consumer has
//!    read
//!
//! A task that finds the channel busy stays pending.  The task is triggered
//! again when the command in flight completes, or straight away if the card
//! has yet to take the previous vector.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::command::{Command, INT_RPC, QT_TAIL, Reply};
use crate::device::{Completion, Device, DeviceState, Dispatched, Request, StateFlags};
use crate::{Error, Platform, Result};

impl<P: Platform> Device<P> {
    /// Ask the card to be told the consumer's progress.
    pub fn request_grant(&self) {
        self.request(StateFlags::SEND_GRANT);
    }

    /// Ask for the quiet reply pointer to be cleared.
    pub fn request_clear_pointer(&self) {
        self.request(StateFlags::CLEAR_POINTER);
    }

    fn request(&self, task: StateFlags) {
        let mut state = self.state.lock();
        state.pending |= task;
        trace!("card{}: priority task {:?} requested", self.config.card, task);
        self.schedule_locked(&mut state);
    }

    /// Queue a command to be sent by the priority task, through any
    /// reservation.
    ///
    /// There is a single relay slot.  Returns [`Error::Busy`] if it is
    /// occupied.  Otherwise `completion` is called exactly once: with the
    /// outcome of the command, or with the error that prevented it being
    /// sent.
    pub fn queue_relay(&self, cmd: Command, completion: Completion<P>) -> Result<()> {
        let mut state = self.state.lock();
        if state.relay.is_some() {
            return Err(Error::Busy);
        }
        state.relay = Some((cmd, completion));
        state.pending |= StateFlags::RELAY_SESSION_CMD;
        self.schedule_locked(&mut state);
        Ok(())
    }

    /// Run one pass of the priority task.
    ///
    /// Must be called from the context the platform runs on
    /// [`crate::Platform::trigger_priority_task`], and never concurrently
    /// with itself.
    pub fn run_priority_task(&self) {
        let deferred = {
            let mut state = self.state.lock();
            state.task_triggered = false;

            if state.release_pending && !self.release_locked(&mut state) {
                trace!("card{}: release still deferred", self.config.card);
            }

            let deferred = if state.pending.contains(StateFlags::CLEAR_POINTER) {
                self.clear_pointer_locked(&mut state)
            } else if state.pending.contains(StateFlags::RELAY_SESSION_CMD) {
                self.relay_locked(&mut state)
            } else if state.pending.contains(StateFlags::SEND_GRANT) {
                self.grant_locked(&mut state)
            } else {
                None
            };

            self.schedule_locked(&mut state);
            deferred
        };

        if let Some((completion, result)) = deferred {
            completion(self, result);
        }
    }

    // Settle a priority submission.  Returns a completion to run once
    // unlocked, if any.
    fn settle(
        &self,
        state: &mut DeviceState<P>,
        task: StateFlags,
        outcome: core::result::Result<Dispatched<P>, (Error, Completion<P>)>,
    ) -> Option<(Completion<P>, Result<Reply>)> {
        match outcome {
            Ok(Dispatched::Pending) => {
                state.pending.remove(task);
                None
            }
            Ok(Dispatched::Complete(completion, reply)) => {
                state.pending.remove(task);
                Some((completion, Ok(reply)))
            }
            Err((Error::Busy, _)) => {
                trace!("card{}: {:?} waits for the channel", self.config.card, task);
                None
            }
            Err((e, completion)) => {
                state.pending.remove(task);
                error!("card{}: priority task {:?} failed: {e}", self.config.card, task);
                Some((completion, Err(e)))
            }
        }
    }

    fn clear_pointer_locked(
        &self,
        state: &mut DeviceState<P>,
    ) -> Option<(Completion<P>, Result<Reply>)> {
        let outcome = self.submit_locked(
            state,
            Command::bare(INT_RPC),
            Request::Priority,
            alloc::boxed::Box::new(|_: &Device<P>, _: Result<Reply>| ()),
        );
        self.settle(state, StateFlags::CLEAR_POINTER, outcome)
    }

    fn relay_locked(&self, state: &mut DeviceState<P>) -> Option<(Completion<P>, Result<Reply>)> {
        let Some((cmd, completion)) = state.relay.take() else {
            state.pending.remove(StateFlags::RELAY_SESSION_CMD);
            return None;
        };
        match self.submit_locked(state, cmd, Request::Priority, completion) {
            Err((Error::Busy, completion)) => {
                state.relay = Some((cmd, completion));
                None
            }
            outcome => self.settle(state, StateFlags::RELAY_SESSION_CMD, outcome),
        }
    }

    fn grant_locked(&self, state: &mut DeviceState<P>) -> Option<(Completion<P>, Result<Reply>)> {
        let tail = state.frames.tail;
        let outcome = self.submit_locked(
            state,
            Command::qt(QT_TAIL, tail, 0),
            Request::Priority,
            alloc::boxed::Box::new(move |device: &Device<P>, result: Result<Reply>| {
                if let Err(e) = result.and_then(Reply::ack) {
                    error!("card{}: grant of tail {tail} failed: {e}", device.card());
                }
            }),
        );
        let granted = outcome.is_ok();
        let deferred = self.settle(state, StateFlags::SEND_GRANT, outcome);
        if granted {
            trace!("card{}: granted tail {tail}", self.config.card);
            state.frames.record_grant(tail);
        }
        deferred
    }
}
