//! Device state machine - one per card.
//!
//! A [`Device`] owns everything the interrupt path, the deferred priority
//! task and callers share: the command in flight and its completion, the
//! reservation, the pending priority tasks, the message handler table and the
//! frame buffer indices.  All of it sits behind a single lock, held only for
//! the duration of a state transition.  Completions and handlers are always
//! invoked after the lock has been released, so they are free to submit new
//! commands.
//!
//! At most one handshaken command is outstanding per device.  It leaves the
//! in-flight state exactly once, through whichever of [`Device::on_interrupt`]
//! and [`Device::on_timeout`] takes the lock first.
//!
//! Submodules:
//! - [`priority`] - the deferred priority task
//! - [`frames`] - frame buffer flow control
//! - [`futures`] - [`Device::blocking_send`]

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod frames;
#[cfg(feature = "async")]
pub mod futures;
pub mod priority;

#[cfg(feature = "async")]
pub use futures::AsyncDelay;
pub use frames::{FrameBuffer, FrameEvent, FrameInformHandler, FrameObserver, FrameStatus};

use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::command::{
    Command, HEY, INT_DON, INT_RST, Message, RECORD_WORDS, Reply, VersionString, legacy_version_string,
};
use crate::dispatch::{self, Mode};
use crate::regs::{DATA_MASK, HCVR_HNMI, HostControl, HostStatus, Register, RegisterIo};
use crate::session::SessionStatus;
use crate::{Deadline, Error, Platform, Result};

/// Maximum number of registered message handlers per device.
pub const MAX_HANDLERS: usize = 16;

bitflags! {
    /// Device state flags.  Not mutually exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        /// A handshaken command awaits its reply
        const CMD_IN_FLIGHT = 0x01;
        /// A caller holds the device across a multi-step exchange
        const RESERVED = 0x02;
        /// Priority task: announce the consumer's tail to the card
        const SEND_GRANT = 0x10;
        /// Priority task: clear the quiet reply pointer
        const CLEAR_POINTER = 0x20;
        /// Priority task: send a queued session command
        const RELAY_SESSION_CMD = 0x40;
    }
}

impl StateFlags {
    /// All priority task bits.
    pub const PRIORITY: StateFlags = StateFlags::SEND_GRANT
        .union(StateFlags::CLEAR_POINTER)
        .union(StateFlags::RELAY_SESSION_CMD);
}

/// How a submission interacts with the device's reservation and the pending
/// priority tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// An ordinary command.  Refused while the device is reserved or priority
    /// tasks are pending.
    Normal,
    /// As `Normal`, and on success the device stays reserved until
    /// [`Device::unreserve`].
    Reserve,
    /// Issued by the priority task.  Allowed through a reservation and ahead
    /// of other pending priority tasks.
    Priority,
}

/// Called exactly once with the outcome of a dispatched command.
pub type Completion<P> = Box<dyn FnOnce(&Device<P>, Result<Reply>) + Send>;

/// Receives messages routed by type code from the interrupt path.
pub trait MessageHandler<P: Platform>: Send + Sync {
    fn handle(&self, device: &Device<P>, message: &Message);
}

/// Logs `HEY` debug messages.  Installed on every device at creation.
pub struct DebugHandler;

impl<P: Platform> MessageHandler<P> for DebugHandler {
    fn handle(&self, device: &Device<P>, message: &Message) {
        if let Message::Debug(words) = message {
            info!(
                "card{}: debug {:#08x} {:#08x} {:#08x}",
                device.card(),
                words[0],
                words[1],
                words[2]
            );
        }
    }
}

/// Per-device settings.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Card number, used in diagnostics
    pub card: u8,
    /// Deadline for a handshaken command's reply
    pub reply_timeout_us: u32,
    /// How many status reads to wait for the card to drop HF3 before the
    /// interrupt release is deferred to the priority task
    pub interrupt_spin: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            card: 0,
            reply_timeout_us: 100_000,
            interrupt_spin: 1_000,
        }
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub commands: u32,
    pub replies: u32,
    pub timeouts: u32,
    /// Replies or notifications inconsistent with the device's state
    pub violations: u32,
    /// Messages with no registered handler
    pub unhandled: u32,
}

/// Diagnostic snapshot of a device.
#[derive(Debug, Clone)]
pub struct Status {
    pub card: u8,
    pub flags: StateFlags,
    pub version: u32,
    pub version_string: VersionString,
    pub handshake: bool,
    pub counters: Counters,
    pub frames: FrameStatus,
    pub session: Option<SessionStatus>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "card{}: state ", self.card)?;
        if self.flags.is_empty() {
            write!(f, "idle")?;
        } else {
            for (ii, (name, _)) in self.flags.iter_names().enumerate() {
                if ii > 0 {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
            }
        }
        writeln!(
            f,
            ", firmware {} ({:#08x}){}",
            self.version_string,
            self.version,
            if self.handshake { ", handshake" } else { "" }
        )?;
        let c = &self.counters;
        writeln!(
            f,
            "  commands {} replies {} timeouts {} violations {} unhandled {}",
            c.commands, c.replies, c.timeouts, c.violations, c.unhandled
        )?;
        writeln!(f, "  frames {}", self.frames)?;
        if let Some(session) = &self.session {
            writeln!(f, "  session {session}")?;
        }
        Ok(())
    }
}

struct InFlight<P: Platform> {
    seq: u32,
    command: Command,
    completion: Completion<P>,
}

struct Firmware {
    version: u32,
    string: VersionString,
    control: HostControl,
    hcvr_bits: u32,
}

struct DeviceState<P: Platform> {
    in_flight: Option<InFlight<P>>,
    reserved: bool,
    pending: StateFlags,
    task_triggered: bool,
    // Handshake release deferred until HF3 falls
    release_pending: bool,
    relay: Option<(Command, Completion<P>)>,
    blocking: bool,
    seq: u32,
    handlers: heapless::Vec<(u32, Arc<dyn MessageHandler<P>>), MAX_HANDLERS>,
    frames: FrameBuffer,
    observer: Option<Arc<dyn FrameObserver>>,
    firmware: Firmware,
    counters: Counters,
}

impl<P: Platform> DeviceState<P> {
    fn flags(&self) -> StateFlags {
        let mut flags = self.pending;
        flags.set(StateFlags::CMD_IN_FLIGHT, self.in_flight.is_some());
        flags.set(StateFlags::RESERVED, self.reserved);
        flags
    }
}

enum Dispatched<P: Platform> {
    /// A reply is awaited
    Pending,
    /// Quick command: complete with the synthesized reply once unlocked
    Complete(Completion<P>, Reply),
}

/// Submission failure, returning the completion to the caller.
type Refused<P> = (Error, Completion<P>);

/// A card's command/reply protocol engine.
pub struct Device<P: Platform> {
    platform: P,
    config: DeviceConfig,
    state: Mutex<DeviceState<P>>,
}

impl<P: Platform> Device<P> {
    /// Create a device.  The `HEY` debug handler is installed.
    ///
    /// Until [`Device::set_firmware`] is called all vectors are raised
    /// non-maskable.
    pub fn new(platform: P, config: DeviceConfig) -> Self {
        let mut handlers: heapless::Vec<(u32, Arc<dyn MessageHandler<P>>), MAX_HANDLERS> =
            heapless::Vec::new();
        let debug: Arc<dyn MessageHandler<P>> = Arc::new(DebugHandler);
        // Empty table
        let _ = handlers.push((HEY, debug));

        Self {
            platform,
            config,
            state: Mutex::new(DeviceState {
                in_flight: None,
                reserved: false,
                pending: StateFlags::empty(),
                task_triggered: false,
                release_pending: false,
                relay: None,
                blocking: false,
                seq: 0,
                handlers,
                frames: FrameBuffer::new(),
                observer: None,
                firmware: Firmware {
                    version: 0,
                    string: legacy_version_string(),
                    control: HostControl::PCI_MODE_BASE,
                    hcvr_bits: HCVR_HNMI,
                },
                counters: Counters::default(),
            }),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn card(&self) -> u8 {
        self.config.card
    }

    /// Current state flags.
    pub fn flags(&self) -> StateFlags {
        self.state.lock().flags()
    }

    /// Submit a command.
    ///
    /// On success a handshaken command is in flight and `completion` will be
    /// called exactly once, with the reply or with [`Error::Timeout`] or
    /// [`Error::ProtocolViolation`].  A quick command is complete once the
    /// vector is written, and `completion` has been called with a
    /// synthesized ACK by the time this returns.
    ///
    /// Returns [`Error::Busy`] if a command is in flight or the card has not
    /// yet taken the previous vector, or, unless this is a
    /// [`Request::Priority`] submission, if the device is reserved or
    /// priority tasks are pending.  Other dispatch errors are returned as is.  On
    /// any error nothing has changed and `completion` is dropped uncalled.
    pub fn submit(&self, cmd: Command, request: Request, completion: Completion<P>) -> Result<()> {
        let outcome = {
            let mut state = self.state.lock();
            self.submit_locked(&mut state, cmd, request, completion)
        };

        match outcome {
            Ok(Dispatched::Pending) => Ok(()),
            Ok(Dispatched::Complete(completion, reply)) => {
                completion(self, Ok(reply));
                Ok(())
            }
            Err((e, _)) => Err(e),
        }
    }

    fn submit_locked(
        &self,
        state: &mut DeviceState<P>,
        cmd: Command,
        request: Request,
        completion: Completion<P>,
    ) -> core::result::Result<Dispatched<P>, Refused<P>> {
        if state.in_flight.is_some() {
            return Err((Error::Busy, completion));
        }
        if request != Request::Priority && (state.reserved || !state.pending.is_empty()) {
            trace!(
                "card{}: refusing {:#08x}, state {:?}",
                self.config.card,
                cmd.code,
                state.flags()
            );
            return Err((Error::Busy, completion));
        }

        let mode = match dispatch::dispatch(
            self.platform.registers(),
            &cmd,
            state.firmware.hcvr_bits,
        ) {
            Ok(mode) => mode,
            Err(e) => {
                warn!(
                    "card{}: dispatch of {:#08x} failed: {e}",
                    self.config.card, cmd.code
                );
                return Err((e, completion));
            }
        };

        state.counters.commands = state.counters.commands.wrapping_add(1);
        if request == Request::Reserve {
            state.reserved = true;
        }

        match mode {
            Mode::Handshaken => {
                state.seq = state.seq.wrapping_add(1);
                let seq = state.seq;
                debug!(
                    "card{}: sent {:#08x} {:?} (seq {seq})",
                    self.config.card, cmd.code, cmd.args
                );
                state.in_flight = Some(InFlight {
                    seq,
                    command: cmd,
                    completion,
                });
                self.platform
                    .arm_timer(Deadline::Reply, seq, self.config.reply_timeout_us);
                Ok(Dispatched::Pending)
            }
            Mode::FireAndForget => {
                trace!("card{}: sent quick {:#08x}", self.config.card, cmd.code);
                Ok(Dispatched::Complete(completion, Reply::synthesized(cmd.code)))
            }
        }
    }

    /// Release a reservation taken with [`Request::Reserve`].
    pub fn unreserve(&self) {
        let mut state = self.state.lock();
        if state.reserved {
            trace!("card{}: unreserved", self.config.card);
        }
        state.reserved = false;
        self.schedule_locked(&mut state);
    }

    /// Handle a raw message read from the card.
    ///
    /// Replies complete the command in flight.  Anything else is routed to
    /// the handler registered for its type code.
    pub fn on_interrupt(&self, words: &[u32; RECORD_WORDS]) {
        match Message::parse(words) {
            Message::Reply(reply) => self.complete_reply(reply),
            message => self.route(&message),
        }
    }

    fn complete_reply(&self, reply: Reply) {
        let (completion, result) = {
            let mut state = self.state.lock();
            let Some(in_flight) = state.in_flight.take() else {
                state.counters.violations = state.counters.violations.wrapping_add(1);
                warn!(
                    "card{}: reply to {:#08x} with no command in flight, discarded",
                    self.config.card, reply.command
                );
                return;
            };
            self.platform.cancel_timer(Deadline::Reply);
            state.counters.replies = state.counters.replies.wrapping_add(1);

            let result = if reply.command == in_flight.command.code {
                trace!(
                    "card{}: reply to {:#08x} status {:#08x} data {:#08x}",
                    self.config.card, reply.command, reply.status, reply.data
                );
                Ok(reply)
            } else {
                state.counters.violations = state.counters.violations.wrapping_add(1);
                error!(
                    "card{}: reply to {:#08x} does not match command {:#08x}",
                    self.config.card, reply.command, in_flight.command.code
                );
                Err(Error::ProtocolViolation)
            };

            self.schedule_locked(&mut state);
            (in_flight.completion, result)
        };

        completion(self, result);
    }

    fn route(&self, message: &Message) {
        let code = message.code();
        let handler = {
            let mut state = self.state.lock();
            let handler = state
                .handlers
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, h)| h.clone());
            if handler.is_none() {
                state.counters.unhandled = state.counters.unhandled.wrapping_add(1);
            }
            handler
        };

        match handler {
            Some(handler) => handler.handle(self, message),
            None => warn!(
                "card{}: unhandled message {:#08x}: {:?}",
                self.config.card, code, message
            ),
        }
    }

    /// Deadline timer expiry for the command dispatched with sequence `token`.
    ///
    /// A no-op if that command has already completed.
    pub fn on_timeout(&self, token: u32) {
        let in_flight = {
            let mut state = self.state.lock();
            let Some(in_flight) = state.in_flight.take_if(|f| f.seq == token) else {
                trace!("card{}: stale timer {token}", self.config.card);
                return;
            };
            state.counters.timeouts = state.counters.timeouts.wrapping_add(1);
            error!(
                "card{}: timed out waiting for reply to {:#08x}",
                self.config.card, in_flight.command.code
            );
            self.schedule_locked(&mut state);
            in_flight
        };

        (in_flight.completion)(self, Err(Error::Timeout));
    }

    /// Register a handler for messages of type `code`, replacing any existing
    /// handler for that code.
    pub fn register_handler(&self, code: u32, handler: Arc<dyn MessageHandler<P>>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.handlers.iter_mut().find(|(c, _)| *c == code) {
            entry.1 = handler;
            return Ok(());
        }
        state
            .handlers
            .push((code, handler))
            .map_err(|_| Error::NoHandlerSlots)
    }

    /// Remove the handler for `code`.  Returns whether there was one.
    pub fn clear_handler(&self, code: u32) -> bool {
        let mut state = self.state.lock();
        match state.handlers.iter().position(|(c, _)| *c == code) {
            Some(ii) => {
                state.handlers.remove(ii);
                true
            }
            None => false,
        }
    }

    /// Register-level interrupt service.
    ///
    /// Returns `false` if the card isn't interrupting.  Otherwise acknowledges
    /// the interrupt, reads the message, releases the card and handles the
    /// message.
    pub fn service_interrupt(&self) -> bool {
        let regs = self.platform.registers();
        if !regs.status().contains(HostStatus::HF3) {
            return false;
        }

        let (words, count) = {
            let mut state = self.state.lock();
            let control = state.firmware.control;
            let handshake = control.contains(HostControl::HANDSHAKE);

            if handshake {
                regs.write(Register::Control, (control | HostControl::HF0).bits());
            } else {
                self.quick_locked(&state, INT_RST);
            }

            let mut words = [0u32; RECORD_WORDS];
            let mut count = 0;
            while count < RECORD_WORDS && regs.status().contains(HostStatus::HRRQ) {
                words[count] = regs.read(Register::Receive) & DATA_MASK;
                count += 1;
            }
            if count < RECORD_WORDS {
                warn!(
                    "card{}: incomplete message {count}/{RECORD_WORDS} (status {:#x})",
                    self.config.card,
                    regs.read(Register::Status)
                );
            }

            if handshake {
                if !self.release_locked(&mut state) {
                    trace!("card{}: release deferred", self.config.card);
                    state.release_pending = true;
                    self.schedule_locked(&mut state);
                }
            } else {
                self.quick_locked(&state, INT_DON);
            }

            (words, count)
        };

        if count > 0 {
            self.on_interrupt(&words);
        }
        true
    }

    // Interrupt housekeeping vectors, written directly rather than submitted.
    fn quick_locked(&self, state: &DeviceState<P>, code: u32) {
        if let Err(e) = dispatch::dispatch(
            self.platform.registers(),
            &Command::bare(code),
            state.firmware.hcvr_bits,
        ) {
            error!("card{}: failed to send {:#08x}: {e}", self.config.card, code);
        }
    }

    // Drop HF0 once the card has dropped HF3.  Returns whether released.
    fn release_locked(&self, state: &mut DeviceState<P>) -> bool {
        let regs = self.platform.registers();
        for _ in 0..self.config.interrupt_spin.max(1) {
            if !regs.status().contains(HostStatus::HF3) {
                regs.write(Register::Control, state.firmware.control.bits());
                state.release_pending = false;
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }

    // Trigger the priority task if it has work and the channel may be free.
    fn schedule_locked(&self, state: &mut DeviceState<P>) {
        let work = state.release_pending || (!state.pending.is_empty() && state.in_flight.is_none());
        if work && !state.task_triggered {
            state.task_triggered = true;
            self.platform.trigger_priority_task();
        }
    }

    /// Write the host control register, remembering the mode for the
    /// interrupt path.
    pub fn set_control(&self, control: HostControl) {
        let mut state = self.state.lock();
        state.firmware.control = control;
        self.platform.registers().write(Register::Control, control.bits());
        debug!("card{}: control mode {:#x}", self.config.card, control.bits());
    }

    pub fn control(&self) -> HostControl {
        self.state.lock().firmware.control
    }

    /// Record the firmware version found at probe.  Vectors are raised
    /// maskable from U0105.
    pub fn set_firmware(&self, version: u32, string: VersionString) {
        let mut state = self.state.lock();
        state.firmware.hcvr_bits = if version >= crate::command::U0105 {
            0
        } else {
            HCVR_HNMI
        };
        info!("card{}: firmware {}", self.config.card, string);
        state.firmware.version = version;
        state.firmware.string = string;
    }

    /// Firmware version, 0 if the card predates the version query.
    pub fn version(&self) -> u32 {
        self.state.lock().firmware.version
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().counters
    }

    /// Diagnostic snapshot.
    pub fn status(&self) -> Status {
        let state = self.state.lock();
        Status {
            card: self.config.card,
            flags: state.flags(),
            version: state.firmware.version,
            version_string: state.firmware.string.clone(),
            handshake: state.firmware.control.contains(HostControl::HANDSHAKE),
            counters: state.counters,
            frames: state.frames.status(),
            session: None,
        }
    }

    pub(crate) fn record_violation(&self) {
        let mut state = self.state.lock();
        state.counters.violations = state.counters.violations.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::*;
    use crate::testing::{MockPlatform, noop, recorder};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::vec::Vec;

    fn device() -> Device<MockPlatform> {
        Device::new(MockPlatform::new(), DeviceConfig::default())
    }

    fn ack(code: u32) -> [u32; 4] {
        [REP, code, ACK, 0]
    }

    #[test]
    fn reply_completes_command() {
        let device = device();
        let (rec, completion) = recorder();
        device
            .submit(Command::bare(VER), Request::Normal, completion)
            .unwrap();
        assert_eq!(device.flags(), StateFlags::CMD_IN_FLIGHT);
        assert_eq!(device.platform().armed(Deadline::Reply), Some(1));

        device.on_interrupt(&[REP, VER, ACK, U0105]);
        assert_eq!(
            rec.results(),
            vec![Ok(Reply {
                command: VER,
                status: ACK,
                data: U0105
            })]
        );
        assert!(device.flags().is_empty());
        assert_eq!(device.platform().armed(Deadline::Reply), None);
    }

    #[test]
    fn single_outstanding_under_contention() {
        let device = Arc::new(device());
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let device = device.clone();
                let barrier = barrier.clone();
                let successes = successes.clone();
                thread::spawn(move || {
                    barrier.wait();
                    match device.submit(Command::bare(GOA), Request::Normal, noop()) {
                        Ok(()) => {
                            successes.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => assert_eq!(e, Error::Busy),
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(device.counters().commands, 1);
    }

    #[test]
    fn racing_reply_and_timeout_complete_once() {
        let device = Arc::new(device());
        let rounds = 200;

        for _ in 0..rounds {
            let (rec, completion) = recorder();
            device
                .submit(Command::bare(STP), Request::Normal, completion)
                .unwrap();
            let token = device.platform().armed(Deadline::Reply).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let replying = {
                let device = device.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    device.on_interrupt(&ack(STP));
                })
            };
            let expiring = {
                let device = device.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    device.on_timeout(token);
                })
            };
            replying.join().unwrap();
            expiring.join().unwrap();

            let results = rec.results();
            assert_eq!(results.len(), 1);
            assert!(matches!(results[0], Ok(_) | Err(Error::Timeout)));
            assert!(device.flags().is_empty());
        }

        let counters = device.counters();
        assert_eq!(counters.replies + counters.timeouts, rounds);
        assert_eq!(counters.replies + counters.violations, rounds);
    }

    #[test]
    fn reply_then_timeout_completes_once() {
        let device = device();
        let (rec, completion) = recorder();
        device
            .submit(Command::bare(STP), Request::Normal, completion)
            .unwrap();
        let token = device.platform().armed(Deadline::Reply).unwrap();

        device.on_interrupt(&ack(STP));
        device.on_timeout(token);
        assert_eq!(rec.count(), 1);
        assert!(rec.results()[0].is_ok());
    }

    #[test]
    fn timeout_then_reply_completes_once() {
        let device = device();
        let (rec, completion) = recorder();
        device
            .submit(Command::bare(STP), Request::Normal, completion)
            .unwrap();
        let token = device.platform().armed(Deadline::Reply).unwrap();

        device.on_timeout(token);
        device.on_interrupt(&ack(STP));
        assert_eq!(rec.results(), vec![Err(Error::Timeout)]);
        assert_eq!(device.counters().violations, 1);
        assert!(device.flags().is_empty());
    }

    #[test]
    fn stale_timer_is_ignored() {
        let device = device();
        let (rec, completion) = recorder();
        device
            .submit(Command::bare(GOA), Request::Normal, completion)
            .unwrap();
        let first = device.platform().armed(Deadline::Reply).unwrap();
        device.on_interrupt(&ack(GOA));

        let (rec2, completion) = recorder();
        device
            .submit(Command::bare(STP), Request::Normal, completion)
            .unwrap();
        device.on_timeout(first);
        assert_eq!(rec.count(), 1);
        assert_eq!(rec2.count(), 0);
        assert_eq!(device.flags(), StateFlags::CMD_IN_FLIGHT);
    }

    #[test]
    fn mismatched_echo_is_a_violation() {
        let device = device();
        let (rec, completion) = recorder();
        device
            .submit(Command::bare(GOA), Request::Normal, completion)
            .unwrap();
        device.on_interrupt(&ack(STP));
        assert_eq!(rec.results(), vec![Err(Error::ProtocolViolation)]);
        assert_eq!(device.counters().violations, 1);
        assert!(device.flags().is_empty());
    }

    #[test]
    fn dispatch_failure_leaves_state_unchanged() {
        let device = device();
        device.platform().registers().set_ready(false);
        let (rec, completion) = recorder();
        assert_eq!(
            device.submit(Command::bare(VER), Request::Reserve, completion),
            Err(Error::NotReady)
        );
        assert!(device.flags().is_empty());
        assert_eq!(device.platform().armed(Deadline::Reply), None);
        assert_eq!(rec.count(), 0);

        assert_eq!(
            device.submit(Command::bare(0x41_4243), Request::Normal, noop()),
            Err(Error::UnknownCommand)
        );
    }

    #[test]
    fn quick_command_completes_immediately() {
        let device = device();
        let (rec, completion) = recorder();
        device
            .submit(Command::bare(SYS_ERR), Request::Normal, completion)
            .unwrap();
        assert_eq!(rec.results(), vec![Ok(Reply::synthesized(SYS_ERR))]);
        assert!(device.flags().is_empty());
    }

    #[test]
    fn reservation_survives_reply() {
        let device = device();
        device
            .submit(Command::bare(CON), Request::Reserve, noop())
            .unwrap();
        device.on_interrupt(&ack(CON));
        assert_eq!(device.flags(), StateFlags::RESERVED);
        assert_eq!(
            device.submit(Command::bare(GOA), Request::Normal, noop()),
            Err(Error::Busy)
        );
        device
            .submit(Command::bare(HST), Request::Priority, noop())
            .unwrap();
        device.on_interrupt(&ack(HST));

        device.unreserve();
        device
            .submit(Command::bare(GOA), Request::Normal, noop())
            .unwrap();
    }

    #[test]
    fn completion_may_submit() {
        let device = device();
        let (rec, completion) = recorder();
        device
            .submit(
                Command::bare(GOA),
                Request::Normal,
                Box::new(move |device: &Device<MockPlatform>, _: Result<Reply>| {
                    device
                        .submit(Command::bare(STP), Request::Normal, completion)
                        .unwrap();
                }),
            )
            .unwrap();
        device.on_interrupt(&ack(GOA));
        assert_eq!(device.flags(), StateFlags::CMD_IN_FLIGHT);
        device.on_interrupt(&ack(STP));
        assert_eq!(rec.count(), 1);
    }

    struct Counting(AtomicUsize);

    impl MessageHandler<MockPlatform> for Counting {
        fn handle(&self, _device: &Device<MockPlatform>, _message: &Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn notifications_route_by_code() {
        let device = device();
        let first = Arc::new(Counting(AtomicUsize::new(0)));
        let second = Arc::new(Counting(AtomicUsize::new(0)));

        device.register_handler(NFY, first.clone()).unwrap();
        device.on_interrupt(&[NFY, NFY_RP, 0, 0]);
        device.register_handler(NFY, second.clone()).unwrap();
        device.on_interrupt(&[NFY, NFY_RP, 0, 0]);
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);

        assert!(device.clear_handler(NFY));
        assert!(!device.clear_handler(NFY));
        device.on_interrupt(&[NFY, NFY_RP, 0, 0]);
        device.on_interrupt(&[0x12_3456, 0, 0, 0]);
        assert_eq!(device.counters().unhandled, 2);

        // Debug messages are handled out of the box
        device.on_interrupt(&[HEY, 1, 2, 3]);
        assert_eq!(device.counters().unhandled, 2);
    }

    #[test]
    fn handler_table_is_bounded() {
        let device = device();
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        // HEY already occupies one slot
        for code in 0..(MAX_HANDLERS as u32 - 1) {
            device.register_handler(code, handler.clone()).unwrap();
        }
        assert_eq!(
            device.register_handler(0x100, handler.clone()),
            Err(Error::NoHandlerSlots)
        );
        // Re-registration replaces in place
        device.register_handler(3, handler).unwrap();
    }

    #[test]
    fn service_interrupt_legacy_mode() {
        let device = device();
        let regs = device.platform().registers();
        assert!(!device.service_interrupt());

        let (rec, completion) = recorder();
        device
            .submit(Command::bare(RST), Request::Normal, completion)
            .unwrap();
        regs.raise(&ack(RST));
        assert!(device.service_interrupt());
        assert_eq!(rec.count(), 1);

        let vectors: Vec<u32> = regs.vectors().iter().map(|(v, _)| *v).collect();
        assert_eq!(
            vectors,
            vec![
                0x0080 | HCVR_HNMI | crate::regs::HCVR_HC,
                0x8073 | HCVR_HNMI | crate::regs::HCVR_HC,
                0x8075 | HCVR_HNMI | crate::regs::HCVR_HC,
            ]
        );
    }

    #[test]
    fn service_interrupt_handshake_mode() {
        let device = device();
        let regs = device.platform().registers();
        device.set_control(HostControl::PCI_MODE_BASE | HostControl::HANDSHAKE);
        device.set_firmware(U0105, version_string(U0105));

        regs.raise(&[HEY, 1, 2, 3]);
        assert!(device.service_interrupt());
        assert_eq!(
            regs.controls(),
            vec![
                0x910,
                0x910 | HostControl::HF0.bits(),
                0x910,
            ]
        );
        assert!(regs.vectors().is_empty());
    }

    #[test]
    fn slow_release_is_deferred() {
        let device = device();
        let regs = device.platform().registers();
        device.set_control(HostControl::PCI_MODE_BASE | HostControl::HANDSHAKE);
        regs.set_hold_hf3(true);

        regs.raise(&[HEY, 1, 2, 3]);
        assert!(device.service_interrupt());
        assert_eq!(device.platform().triggers(), 1);
        assert_eq!(regs.control(), 0x918);

        regs.set_hold_hf3(false);
        device.run_priority_task();
        assert_eq!(regs.control(), 0x910);
    }

    #[test]
    fn status_display() {
        let device = device();
        device
            .submit(Command::bare(GOA), Request::Reserve, noop())
            .unwrap();
        let text = std::format!("{}", device.status());
        assert!(text.starts_with("card0: state CMD_IN_FLIGHT|RESERVED, firmware <=U0103"));
        assert!(text.contains("commands 1 replies 0"));
    }
}
