//! Command/reply protocol engine for PCI DSP cards that drive multi-channel
//! readout electronics.
//!
//! The card is driven through five host interface registers.  Commands are
//! fixed 4-word records pushed through a transmit FIFO and triggered by
//! writing a vector address; replies and notifications come back as 4-word
//! records read by the interrupt handler.  This crate turns that into a
//! reliable request/response and streaming abstraction, shared safely between
//! an interrupt handler, a deferred priority task and any number of callers.
//!
//! `no_std`.  Requires `alloc`.
//!
//! ## Architecture
//!
//! Layers, leaves first:
//!
//! - [`regs`] - register transport.  The [`regs::RegisterIo`] trait, and an
//!   MMIO implementation.
//! - [`dispatch`] - maps opcodes to vectors and delivers commands, either
//!   handshaken (words, then vector, then a reply) or fire-and-forget.
//! - [`device`] - the per-card state machine.  Exactly one handshaken command
//!   is outstanding at a time, and it completes exactly once, by reply or by
//!   timeout.  Also the priority task scheduler ([`device::priority`]) and the
//!   frame buffer flow control ([`device::frames`]).
//! - [`session`] - the exchange that carries a command to the readout
//!   electronics through a shared buffer, and its reply back.
//! - [`card`] - the per-card composition of the above, including the probe
//!   sequence that selects the session protocol from the firmware version.
//!
//! Replies flow upwards through completions, which are always called with no
//! lock held, so they may submit further commands.
//!
//! ## Integration
//!
//! The crate has no knowledge of the host operating system.  The application
//! provides a [`Platform`]:
//!
//! - the card's registers, e.g. [`regs::MmioRegisters`] over the mapped BAR 0
//! - the shared session buffer, see [`session::SharedBuffer`]
//! - a monotonic clock
//! - one-shot deadline timers.  On expiry the application calls
//!   [`card::Card::on_timer`] (or [`device::Device::on_timeout`]) with the
//!   token the timer was armed with
//! - a deferred task.  When triggered the application arranges for
//!   [`device::Device::run_priority_task`] to be called from a non-blocking
//!   context, one run at a time
//!
//! and calls [`device::Device::service_interrupt`] from its interrupt
//! handler.
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable [`device::Device::blocking_send`] and the async parts of
//!   [`card::Card`], which wait for the card by polling with an
//!   application-supplied [`device::AsyncDelay`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod card;
pub mod command;
pub mod device;
pub mod dispatch;
pub mod regs;
pub mod session;

#[cfg(test)]
mod testing;

use core::fmt;

/// Errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The card is not ready to accept a command; nothing was sent
    NotReady,
    /// The transmit FIFO filled mid-command; the vector was not raised
    Overrun,
    /// The device is in use
    Busy,
    /// No reply within the deadline
    Timeout,
    /// A reply or notification inconsistent with the protocol state
    ProtocolViolation,
    /// No vector for the opcode
    UnknownCommand,
    /// The card dropped frames.  Informational: streaming continues
    FramesDropped(u32),
    /// No frame available
    NoData,
    /// The card refused the command
    Nak,
    /// Parameter out of range
    InvalidArgument,
    /// Message handler table full
    NoHandlerSlots,
    /// Session protocol not yet selected
    Uninit,
    /// Firmware this engine cannot drive
    Unsupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotReady => write!(f, "card not ready"),
            Error::Overrun => write!(f, "transmit overrun"),
            Error::Busy => write!(f, "device busy"),
            Error::Timeout => write!(f, "timed out"),
            Error::ProtocolViolation => write!(f, "protocol violation"),
            Error::UnknownCommand => write!(f, "unknown command"),
            Error::FramesDropped(n) => write!(f, "{n} frames dropped"),
            Error::NoData => write!(f, "no data"),
            Error::Nak => write!(f, "command refused"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NoHandlerSlots => write!(f, "no handler slots"),
            Error::Uninit => write!(f, "not initialized"),
            Error::Unsupported => write!(f, "unsupported firmware"),
        }
    }
}

/// Type to represent the result of an operation
pub type Result<T> = core::result::Result<T, Error>;

/// Deadline timers a device arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Reply to the handshaken command in flight
    Reply,
    /// Completion of a session exchange
    Session,
}

/// Services the engine needs from its host.
///
/// All methods may be called from interrupt context and with the device lock
/// held, so must not block.
pub trait Platform: Send + Sync + 'static {
    type Registers: regs::RegisterIo;
    type Buffer: session::SharedBuffer;

    fn registers(&self) -> &Self::Registers;

    fn buffer(&self) -> &Self::Buffer;

    /// Monotonic time in microseconds
    fn now_us(&self) -> u64;

    /// Arm, or re-arm, the one-shot `deadline` timer.  On expiry `token` is
    /// passed back to the engine.
    fn arm_timer(&self, deadline: Deadline, token: u32, timeout_us: u32);

    fn cancel_timer(&self, deadline: Deadline);

    /// Schedule a run of [`device::Device::run_priority_task`].
    fn trigger_priority_task(&self);
}
