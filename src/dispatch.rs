//! Command dispatcher.
//!
//! Maps an opcode to the vector that triggers it on the card and issues the
//! transfer.  Standard commands are handshaken: the 4 command words go through
//! the transmit FIFO and the card replies with a [`crate::command::REP`]
//! message.  Quick commands are fire-and-forget: only the vector is written,
//! and the card never interrupts in response.
//!
//! Nothing here touches device state.  [`crate::device::Device`] sequences
//! calls to [`dispatch`] under its own lock.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::command::*;
use crate::regs::{HCVR_HC, HostStatus, Register, RegisterIo};
use crate::{Error, Result};

/// How a command is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Command words through the FIFO, then the vector.  A reply follows.
    Handshaken,
    /// Vector only.  No reply.
    FireAndForget,
}

/// Vector address and delivery mode for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vector {
    pub address: u32,
    pub mode: Mode,
}

const fn standard(address: u32) -> Vector {
    Vector {
        address,
        mode: Mode::Handshaken,
    }
}

const fn quick(address: u32) -> Vector {
    Vector {
        address,
        mode: Mode::FireAndForget,
    }
}

const VECTORS: &[(u32, Vector)] = &[
    (WRM, standard(0x0078)),
    (RDM, standard(0x007A)),
    (VER, standard(0x007A)),
    (GOA, standard(0x007C)),
    (STP, standard(0x007E)),
    (RST, standard(0x0080)),
    (CON, standard(0x0082)),
    (HST, standard(0x0084)),
    (RCO, standard(0x0086)),
    (QTS, standard(0x0088)),
    (INT_RST, quick(0x8073)),
    (INT_DON, quick(0x8075)),
    (SYS_ERR, quick(0x8077)),
    (SYS_RST, quick(0x808B)),
    (INT_RPC, quick(0x808D)),
    (SYS_IRQ0, quick(0x808F)),
    (SYS_IRQ1, quick(0x8091)),
];

/// Find the vector for an opcode.
pub fn lookup(code: u32) -> Result<Vector> {
    VECTORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, v)| *v)
        .ok_or(Error::UnknownCommand)
}

/// Deliver a command to the card.
///
/// `hcvr_bits` are ORed into the vector write; on firmware before U0105 they
/// carry [`crate::regs::HCVR_HNMI`].
///
/// Fails with [`Error::Busy`] if the card hasn't taken the previous vector
/// yet, and with [`Error::NotReady`] if, for a handshaken command, the
/// transmitter isn't ready.  Nothing has been written in either case.  Fails with [`Error::Overrun`] if
/// the FIFO fills part way through the command words, in which case the
/// vector is not raised.
pub fn dispatch<R: RegisterIo + ?Sized>(regs: &R, cmd: &Command, hcvr_bits: u32) -> Result<Mode> {
    let vector = lookup(cmd.code)?;

    if regs.read(Register::Vector) & HCVR_HC != 0 {
        debug!("Vector still pending, can't dispatch {:#08x}", cmd.code);
        return Err(Error::Busy);
    }

    if vector.mode == Mode::Handshaken {
        if !regs.status().contains(HostStatus::TRDY) {
            debug!("Transmitter not ready, can't dispatch {:#08x}", cmd.code);
            return Err(Error::NotReady);
        }

        for (ii, word) in cmd.words().iter().enumerate() {
            if !regs.status().contains(HostStatus::HTRQ) {
                error!("Transmit FIFO full after {ii} words of {:#08x}", cmd.code);
                return Err(Error::Overrun);
            }
            regs.write(Register::Transmit, *word);
        }
    }

    trace!("Vector {:#06x} for {:#08x}", vector.address, cmd.code);
    regs.write(Register::Vector, vector.address | hcvr_bits | HCVR_HC);

    Ok(vector.mode)
}
