//! Session protocol - commands relayed to the readout electronics.
//!
//! A session command is too large to pass through the command FIFO, so it is
//! written to a buffer shared with the card and the card is told where to find
//! it with `CON`.  The reply comes back the same way.  There are two
//! generations of the exchange, chosen once at probe from the firmware
//! version:
//!
//! - [`SessionMode::TwoPhase`]: `CON` is ACKed, the card later raises an
//!   `NFY RP` notification, the host sends `HST` to have the reply copied into
//!   the shared buffer, and the `HST` ACK completes the exchange.
//! - [`SessionMode::OnePhase`]: the card is configured to write replies to the
//!   shared buffer itself.  After the `CON` ACK it raises `NFY RPQ` once the
//!   reply is in place, and the host completes the exchange immediately and
//!   has the reply pointer cleared by the priority task.
//!
//! The device stays reserved for the whole exchange, so ordinary commands
//! can't interleave.  The caller's completion is invoked exactly once, and any
//! failure after `CON` has been sent returns the session to idle.
//!
//! Lock order is session state before device state.  Neither lock is held
//! while calling the device or the caller's completion.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::{Mutex, Once};

use crate::command::{CON, Command, HST, Message, NFY_RP, NFY_RPQ, Reply};
use crate::device::{Device, MessageHandler, Request};
use crate::{Deadline, Error, Platform, Result};

/// Words in a session command or reply record.
pub const SESSION_WORDS: usize = 64;

/// Data words carried by a session command.
pub const COMMAND_DATA_WORDS: usize = 58;

/// Data words carried by a session reply.
pub const REPLY_DATA_WORDS: usize = 60;

/// Session command preamble.
pub const PREAMBLE: [u32; 2] = [0xA5A5_A5A5, 0x5A5A_5A5A];

/// Reply status: success
pub const MCE_OK: u32 = 0x2020_4B4F;
/// Reply status: the electronics refused the command
pub const MCE_ER: u32 = 0x2020_4552;

// Replies echo the command word without the padding bits
const ECHO_PADDING: u32 = 0x2020_0000;

/// Memory shared with the card for session commands and replies.
///
/// Implementations own the DMA-able buffers.  All methods are called outside
/// any lock but may be called from interrupt context.
pub trait SharedBuffer: Send + Sync {
    /// Bus address of the command buffer, as given to the card
    fn command_busaddr(&self) -> u32;

    /// Bus address of the reply buffer, as given to the card
    fn reply_busaddr(&self) -> u32;

    fn write_command(&self, words: &[u32; SESSION_WORDS]);

    fn read_reply(&self, words: &mut [u32; SESSION_WORDS]);

    /// Invalidate the reply buffer once a reply has been taken.
    fn clear_reply(&self);
}

fn xor(words: &[u32]) -> u32 {
    words.iter().fold(0, |acc, w| acc ^ w)
}

/// A command for the electronics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCommand {
    pub command: u32,
    pub card_id: u16,
    pub para_id: u16,
    /// Number of data words the electronics should read or write
    pub count: u32,
    pub data: [u32; COMMAND_DATA_WORDS],
}

impl SessionCommand {
    /// Build a command.  Fails with [`Error::InvalidArgument`] if `data` or
    /// `count` exceed the record.
    pub fn new(command: u32, card_id: u16, para_id: u16, count: u32, data: &[u32]) -> Result<Self> {
        if data.len() > COMMAND_DATA_WORDS || count as usize > COMMAND_DATA_WORDS {
            return Err(Error::InvalidArgument);
        }
        let mut words = [0; COMMAND_DATA_WORDS];
        words[..data.len()].copy_from_slice(data);
        Ok(Self {
            command,
            card_id,
            para_id,
            count,
            data: words,
        })
    }

    /// The record as written to the shared buffer.  The last word is the
    /// XOR of every word after the preamble.
    pub fn to_words(&self) -> [u32; SESSION_WORDS] {
        let mut words = [0; SESSION_WORDS];
        words[..2].copy_from_slice(&PREAMBLE);
        words[2] = self.command;
        words[3] = u32::from(self.para_id) | u32::from(self.card_id) << 16;
        words[4] = self.count;
        words[5..5 + COMMAND_DATA_WORDS].copy_from_slice(&self.data);
        words[SESSION_WORDS - 1] = xor(&words[2..SESSION_WORDS - 1]);
        words
    }
}

/// A reply from the electronics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReply {
    /// [`MCE_OK`] or [`MCE_ER`]
    pub ok_er: u32,
    pub command: u32,
    pub card_id: u16,
    pub para_id: u16,
    pub data: [u32; REPLY_DATA_WORDS],
}

impl SessionReply {
    /// Parse a reply record, verifying its checksum.
    pub fn from_words(words: &[u32; SESSION_WORDS]) -> Result<Self> {
        let checksum = xor(&words[..SESSION_WORDS - 1]);
        if checksum != words[SESSION_WORDS - 1] {
            return Err(Error::ProtocolViolation);
        }
        let mut data = [0; REPLY_DATA_WORDS];
        data.copy_from_slice(&words[3..3 + REPLY_DATA_WORDS]);
        Ok(Self {
            ok_er: words[0],
            command: words[1],
            card_id: (words[2] >> 16) as u16,
            para_id: (words[2] & 0xFFFF) as u16,
            data,
        })
    }

    /// The record as the card writes it.
    pub fn to_words(&self) -> [u32; SESSION_WORDS] {
        let mut words = [0; SESSION_WORDS];
        words[0] = self.ok_er;
        words[1] = self.command;
        words[2] = u32::from(self.para_id) | u32::from(self.card_id) << 16;
        words[3..3 + REPLY_DATA_WORDS].copy_from_slice(&self.data);
        words[SESSION_WORDS - 1] = xor(&words[..SESSION_WORDS - 1]);
        words
    }

    /// Whether this reply answers `cmd`.
    pub fn answers(&self, cmd: &SessionCommand) -> bool {
        self.command | ECHO_PADDING == cmd.command
            && self.card_id == cmd.card_id
            && self.para_id == cmd.para_id
    }

    pub fn is_ok(&self) -> bool {
        self.ok_er == MCE_OK
    }
}

/// Called exactly once with the outcome of a session exchange.
pub type SessionCompletion = Box<dyn FnOnce(Result<SessionReply>) + Send>;

/// Session protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// CON, NFY RP, HST
    TwoPhase,
    /// CON, NFY RPQ with the reply already in place
    OnePhase,
}

/// Where an exchange has got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// CON sent, awaiting its reply
    Connecting,
    /// CON ACKed, awaiting the notification
    Armed,
    /// HST queued or sent, awaiting its reply
    Fetching,
}

/// Session diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub mode: Option<SessionMode>,
    pub exchanges: u32,
    pub violations: u32,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Some(SessionMode::TwoPhase) => "two-phase",
            Some(SessionMode::OnePhase) => "one-phase",
            None => "unselected",
        };
        write!(
            f,
            "{:?}, {mode}, {} exchanges, {} violations",
            self.phase, self.exchanges, self.violations
        )
    }
}

struct SessionState {
    phase: SessionPhase,
    generation: u32,
    command: Option<SessionCommand>,
    completion: Option<SessionCompletion>,
    exchanges: u32,
    violations: u32,
}

struct Inner {
    card: u8,
    timeout_us: u32,
    mode: Once<SessionMode>,
    state: Mutex<SessionState>,
}

enum Notified {
    Fetch,
    Deliver,
    Abort,
    Ignore,
}

/// Session protocol state for one card.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// `timeout_us` bounds a whole exchange.
    pub fn new(card: u8, timeout_us: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                card,
                timeout_us,
                mode: Once::new(),
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Idle,
                    generation: 0,
                    command: None,
                    completion: None,
                    exchanges: 0,
                    violations: 0,
                }),
            }),
        }
    }

    /// Select the protocol generation.  Only the first call has any effect;
    /// returns the mode in force.
    pub fn set_mode(&self, mode: SessionMode) -> SessionMode {
        let selected = *self.inner.mode.call_once(|| mode);
        if selected != mode {
            warn!(
                "card{}: session mode already {:?}, ignoring {:?}",
                self.inner.card, selected, mode
            );
        }
        selected
    }

    pub fn mode(&self) -> Option<SessionMode> {
        self.inner.mode.get().copied()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.inner.state.lock();
        SessionStatus {
            phase: state.phase,
            mode: self.mode(),
            exchanges: state.exchanges,
            violations: state.violations,
        }
    }

    /// Start an exchange.
    ///
    /// Returns [`Error::Uninit`] before the mode has been selected,
    /// [`Error::Busy`] if an exchange is already under way, or the error from
    /// submitting `CON`.  Otherwise `completion` will be called exactly once.
    pub fn send<P: Platform>(
        &self,
        device: &Device<P>,
        cmd: &SessionCommand,
        completion: SessionCompletion,
    ) -> Result<()> {
        if self.mode().is_none() {
            return Err(Error::Uninit);
        }

        let generation = {
            let mut state = self.inner.state.lock();
            if state.phase != SessionPhase::Idle {
                return Err(Error::Busy);
            }
            state.generation = state.generation.wrapping_add(1);
            state.phase = SessionPhase::Connecting;
            state.command = Some(*cmd);
            state.completion = Some(completion);
            state.generation
        };

        let platform = device.platform();
        let buffer = platform.buffer();
        buffer.write_command(&cmd.to_words());
        let busaddr = buffer.command_busaddr();
        platform.arm_timer(Deadline::Session, generation, self.inner.timeout_us);

        let session = self.clone();
        let connect = Command::new(CON, [busaddr >> 16 & 0xFFFF, busaddr & 0xFFFF, 0]);
        let result = device.submit(
            connect,
            Request::Reserve,
            Box::new(move |device: &Device<P>, result: Result<Reply>| {
                session.connected(device, generation, result)
            }),
        );

        if let Err(e) = result {
            platform.cancel_timer(Deadline::Session);
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.phase = SessionPhase::Idle;
                state.command = None;
                state.completion = None;
            }
            debug!("card{}: session command not sent: {e}", self.inner.card);
            return Err(e);
        }

        debug!(
            "card{}: session command {:#010x} sent (generation {generation})",
            self.inner.card, cmd.command
        );
        Ok(())
    }

    // Outcome of a device command that's part of the exchange.
    fn check(&self, result: Result<Reply>, code: u32) -> Result<Reply> {
        match result {
            Ok(reply) if reply.command != code => Err(Error::ProtocolViolation),
            Ok(reply) if !reply.is_ack() => {
                error!(
                    "card{}: session {:#08x} refused ({:#08x})",
                    self.inner.card, code, reply.status
                );
                Err(Error::ProtocolViolation)
            }
            Ok(reply) => Ok(reply),
            Err(Error::Timeout) => Err(Error::Timeout),
            Err(_) => Err(Error::ProtocolViolation),
        }
    }

    fn connected<P: Platform>(&self, device: &Device<P>, generation: u32, result: Result<Reply>) {
        if let Err(e) = self.check(result, CON) {
            self.finish(device, generation, Err(e));
            return;
        }

        let mut state = self.inner.state.lock();
        if state.generation == generation && state.phase == SessionPhase::Connecting {
            trace!("card{}: session armed", self.inner.card);
            state.phase = SessionPhase::Armed;
        } else {
            warn!(
                "card{}: stale connect reply (generation {generation})",
                self.inner.card
            );
        }
    }

    fn notified<P: Platform>(&self, device: &Device<P>, code: u32) {
        let mode = self.mode();
        let (generation, action) = {
            let mut state = self.inner.state.lock();
            let action = match (mode, code, state.phase) {
                (Some(SessionMode::TwoPhase), NFY_RP, SessionPhase::Armed) => {
                    state.phase = SessionPhase::Fetching;
                    Notified::Fetch
                }
                (Some(SessionMode::OnePhase), NFY_RPQ, SessionPhase::Armed) => Notified::Deliver,
                (_, _, phase) => {
                    state.violations = state.violations.wrapping_add(1);
                    error!(
                        "card{}: unexpected notification {:#08x} while {:?}",
                        self.inner.card, code, phase
                    );
                    if phase == SessionPhase::Idle {
                        Notified::Ignore
                    } else {
                        Notified::Abort
                    }
                }
            };
            (state.generation, action)
        };

        match action {
            Notified::Fetch => {
                let busaddr = device.platform().buffer().reply_busaddr();
                let fetch = Command::new(HST, [busaddr >> 16 & 0xFFFF, busaddr & 0xFFFF, 0]);
                let session = self.clone();
                let queued = device.queue_relay(
                    fetch,
                    Box::new(move |device: &Device<P>, result: Result<Reply>| {
                        session.fetched(device, generation, result)
                    }),
                );
                if let Err(e) = queued {
                    error!("card{}: can't queue fetch: {e}", self.inner.card);
                    self.finish(device, generation, Err(Error::ProtocolViolation));
                }
            }
            Notified::Deliver => {
                let reply = self.read_reply(device);
                device.request_clear_pointer();
                self.finish(device, generation, reply);
            }
            Notified::Abort => {
                device.record_violation();
                self.finish(device, generation, Err(Error::ProtocolViolation));
            }
            Notified::Ignore => device.record_violation(),
        }
    }

    fn fetched<P: Platform>(&self, device: &Device<P>, generation: u32, result: Result<Reply>) {
        let reply = self
            .check(result, HST)
            .and_then(|_| self.read_reply(device));
        self.finish(device, generation, reply);
    }

    fn read_reply<P: Platform>(&self, device: &Device<P>) -> Result<SessionReply> {
        let mut words = [0; SESSION_WORDS];
        device.platform().buffer().read_reply(&mut words);
        let reply = SessionReply::from_words(&words).inspect_err(|_| {
            error!("card{}: session reply checksum mismatch", self.inner.card);
        })?;

        let command = self.inner.state.lock().command;
        match command {
            Some(cmd) if reply.answers(&cmd) => Ok(reply),
            Some(cmd) => {
                error!(
                    "card{}: session reply {:#010x} card {:#x} para {:#x} does not answer {:#010x} card {:#x} para {:#x}",
                    self.inner.card,
                    reply.command,
                    reply.card_id,
                    reply.para_id,
                    cmd.command,
                    cmd.card_id,
                    cmd.para_id
                );
                Err(Error::ProtocolViolation)
            }
            None => Err(Error::ProtocolViolation),
        }
    }

    // Return to idle and complete the caller, once per generation.
    fn finish<P: Platform>(&self, device: &Device<P>, generation: u32, result: Result<SessionReply>) {
        let completion = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.phase == SessionPhase::Idle {
                debug!(
                    "card{}: exchange {generation} already finished",
                    self.inner.card
                );
                return;
            }
            state.phase = SessionPhase::Idle;
            state.command = None;
            state.exchanges = state.exchanges.wrapping_add(1);
            state.completion.take()
        };

        let platform = device.platform();
        platform.cancel_timer(Deadline::Session);
        platform.buffer().clear_reply();
        device.unreserve();

        match &result {
            Ok(reply) => debug!(
                "card{}: session reply {:#010x} status {:#010x}",
                self.inner.card, reply.command, reply.ok_er
            ),
            Err(e) => error!("card{}: session exchange failed: {e}", self.inner.card),
        }

        if let Some(completion) = completion {
            completion(result);
        }
    }

    /// Session deadline expiry for exchange `token`.
    pub fn on_timeout<P: Platform>(&self, device: &Device<P>, token: u32) {
        self.finish(device, token, Err(Error::Timeout));
    }
}

impl<P: Platform> MessageHandler<P> for Session {
    fn handle(&self, device: &Device<P>, message: &Message) {
        if let Message::Notify { code, .. } = *message {
            self.notified(device, code);
        }
    }
}
