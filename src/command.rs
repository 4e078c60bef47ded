//! Fixed-format records exchanged with the card.
//!
//! The card speaks in 24-bit words.  A [`Command`] is 4 words (opcode plus
//! three arguments) transmitted before the vector is raised.  Everything the
//! card sends back arrives as up to 4 words read by the interrupt path, and is
//! classified into a [`Message`] by its first word.
//!
//! Opcodes, message types and status codes are ASCII mnemonics packed into
//! 24 bits, e.g. `VER` is `0x564552`.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::fmt::Write;
use heapless::String;

use crate::{Error, Result};

/// Number of words in a command or message record.
pub const RECORD_WORDS: usize = 4;

// Message types
/// Reply to a handshaken command
pub const REP: u32 = 0x52_4550;
/// Asynchronous notification
pub const NFY: u32 = 0x4E_4659;
/// Quiet-transfer inform (frame buffer progress)
pub const QTI: u32 = 0x51_5449;
/// Debug message
pub const HEY: u32 = 0x48_4559;

// Reply status
/// Command accepted
pub const ACK: u32 = 0x41_434B;
/// Command refused
pub const NAK: u32 = 0x45_5252;

// Notification codes
/// Session reply ready in the shared buffer, must be fetched
pub const NFY_RP: u32 = 0x00_5250;
/// Session reply already written to the shared buffer (quiet reply)
pub const NFY_RPQ: u32 = 0x52_5051;

// Standard (handshaken) commands
/// Write memory
pub const WRM: u32 = 0x57_524D;
/// Read memory
pub const RDM: u32 = 0x52_444D;
/// Firmware version query
pub const VER: u32 = 0x56_4552;
/// Start acquisition
pub const GOA: u32 = 0x47_4F41;
/// Stop acquisition
pub const STP: u32 = 0x53_5450;
/// Reset the electronics
pub const RST: u32 = 0x52_5354;
/// Connect: deliver a session command from the shared buffer
pub const CON: u32 = 0x43_4F4E;
/// Fetch: copy a session reply into the shared buffer
pub const HST: u32 = 0x48_5354;
/// Reset the fibre optic link
pub const RCO: u32 = 0x52_434F;
/// Quiet-transfer settings
pub const QTS: u32 = 0x51_5453;

// Quick (fire-and-forget) commands
/// Clear the card's interrupt request
pub const INT_RST: u32 = 0x49_5253;
/// Release the card after an interrupt
pub const INT_DON: u32 = 0x49_444E;
/// Clear the quiet reply pointer so the buffer may be reused
pub const INT_RPC: u32 = 0x49_5250;
/// Clear a card error condition
pub const SYS_ERR: u32 = 0x53_4552;
/// Reset the card
pub const SYS_RST: u32 = 0x53_5253;
/// Disable card interrupts
pub const SYS_IRQ0: u32 = 0x49_5130;
/// Enable card interrupts
pub const SYS_IRQ1: u32 = 0x49_5131;

// QTS sub-commands (first argument)
pub const QT_ENABLE: u32 = 1;
pub const QT_DELTA: u32 = 2;
pub const QT_NUMBER: u32 = 3;
pub const QT_INFORM: u32 = 4;
pub const QT_PERIOD: u32 = 5;
pub const QT_SIZE: u32 = 6;
pub const QT_TAIL: u32 = 7;
pub const QT_HEAD: u32 = 8;
pub const QT_DROPS: u32 = 9;
pub const QT_BASE: u32 = 10;
pub const QT_BURST: u32 = 11;
pub const QT_RPSIZE: u32 = 12;
pub const QT_RPBASE: u32 = 13;
pub const QT_RPENAB: u32 = 14;

// Firmware versions, as reported by VER: 'U' << 16 | major << 8 | minor
pub const U0103: u32 = 0x55_0103;
pub const U0104: u32 = 0x55_0104;
pub const U0105: u32 = 0x55_0105;
pub const U0106: u32 = 0x55_0106;
pub const U0107: u32 = 0x55_0107;

/// Textual form of a firmware version, e.g. `U0105`.
pub type VersionString = String<8>;

/// Render a version word as reported by `VER`.
///
/// Firmware that refuses `VER` predates the query; callers should use
/// [`legacy_version_string`] for it.
pub fn version_string(version: u32) -> VersionString {
    let mut s = VersionString::new();
    let prefix = char::from(((version >> 16) & 0xFF) as u8);
    // Fits: one char plus two 2-digit fields
    let _ = write!(s, "{}{:02}{:02}", prefix, (version >> 8) & 0xFF, version & 0xFF);
    s
}

/// Version string for firmware that NAKs the version query.
pub fn legacy_version_string() -> VersionString {
    let mut s = VersionString::new();
    let _ = s.push_str("<=U0103");
    s
}

/// A command to the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub code: u32,
    pub args: [u32; 3],
}

impl Command {
    pub const fn new(code: u32, args: [u32; 3]) -> Self {
        Self { code, args }
    }

    /// A command with no arguments, typically a quick command.
    pub const fn bare(code: u32) -> Self {
        Self::new(code, [0; 3])
    }

    /// A quiet-transfer settings command.
    pub const fn qt(sub: u32, arg1: u32, arg2: u32) -> Self {
        Self::new(QTS, [sub, arg1, arg2])
    }

    /// Words as transmitted.  Each is masked to the card's word size.
    pub fn words(&self) -> [u32; RECORD_WORDS] {
        [
            self.code & crate::regs::DATA_MASK,
            self.args[0] & crate::regs::DATA_MASK,
            self.args[1] & crate::regs::DATA_MASK,
            self.args[2] & crate::regs::DATA_MASK,
        ]
    }
}

/// The card's reply to a handshaken command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Echo of the command's opcode
    pub command: u32,
    /// [`ACK`] or [`NAK`]
    pub status: u32,
    pub data: u32,
}

impl Reply {
    /// Reply synthesized for quick commands, which the card never answers.
    pub const fn synthesized(command: u32) -> Self {
        Self {
            command,
            status: ACK,
            data: 0,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.status == ACK
    }

    /// Turn a refused command into [`Error::Nak`].
    pub fn ack(self) -> Result<Self> {
        if self.is_ack() {
            Ok(self)
        } else {
            Err(Error::Nak)
        }
    }
}

/// A message read from the card by the interrupt path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Reply(Reply),
    Notify { code: u32, size_lo: u32, size_hi: u32 },
    QtInform { head: u32, tail: u32, drops: u32 },
    Debug([u32; 3]),
    Unknown { code: u32, words: [u32; 3] },
}

impl Message {
    /// Classify a raw message by its type word.
    pub fn parse(words: &[u32; RECORD_WORDS]) -> Self {
        let [kind, a, b, c] = *words;
        match kind {
            REP => Message::Reply(Reply {
                command: a,
                status: b,
                data: c,
            }),
            NFY => Message::Notify {
                code: a,
                size_lo: b,
                size_hi: c,
            },
            QTI => Message::QtInform {
                head: a,
                tail: b,
                drops: c,
            },
            HEY => Message::Debug([a, b, c]),
            code => Message::Unknown {
                code,
                words: [a, b, c],
            },
        }
    }

    /// The type code used to route the message to a handler.
    pub fn code(&self) -> u32 {
        match self {
            Message::Reply(_) => REP,
            Message::Notify { .. } => NFY,
            Message::QtInform { .. } => QTI,
            Message::Debug(_) => HEY,
            Message::Unknown { code, .. } => *code,
        }
    }
}
