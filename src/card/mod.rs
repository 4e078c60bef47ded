//! A card: device, session protocol and frame buffer together.
//!
//! [`Card`] is what the character-device layer holds for each discovered
//! card.  The synchronous entry points here are the ones called from
//! interrupt and timer context.  Probe, frame buffer configuration and
//! waiting for replies live in [`futures`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;

#[cfg(feature = "async")]
pub use futures::Commander;

use alloc::sync::Arc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::command::{NFY, QTI};
use crate::device::{Device, DeviceConfig, FrameInformHandler, Status};
use crate::session::{Session, SessionCommand, SessionCompletion};
use crate::{Deadline, Platform, Result};

/// Per-card settings.
#[derive(Debug, Clone, Copy)]
pub struct CardConfig {
    pub device: DeviceConfig,
    /// Deadline for a whole session exchange
    pub session_timeout_us: u32,
    /// Deadline for commands sent while waiting, including probe and frame
    /// buffer configuration
    pub command_timeout_us: u32,
    /// Frames between quiet-transfer informs
    pub inform_interval: u32,
    /// Timer counts between informs while frames are arriving slowly
    pub inform_period: u32,
    /// PCI latency timer value to program as the burst size, if any
    pub burst_size: Option<u8>,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            session_timeout_us: 1_000_000,
            command_timeout_us: 1_000_000,
            inform_interval: 1,
            inform_period: 5_000,
            burst_size: None,
        }
    }
}

/// A probed card.  `D` is the delay used while waiting for the card.
pub struct Card<P: Platform, D> {
    device: Device<P>,
    session: Session,
    config: CardConfig,
    _delay: core::marker::PhantomData<D>,
}

impl<P: Platform, D> Card<P, D> {
    /// Create a card and install its message handlers.  Call
    /// [`Card::probe`] before use.
    pub fn new(platform: P, config: CardConfig) -> Result<Self> {
        let device = Device::new(platform, config.device);
        let session = Session::new(config.device.card, config.session_timeout_us);
        device.register_handler(NFY, Arc::new(session.clone()))?;
        device.register_handler(QTI, Arc::new(FrameInformHandler))?;

        Ok(Self {
            device,
            session,
            config,
            _delay: core::marker::PhantomData,
        })
    }

    pub fn device(&self) -> &Device<P> {
        &self.device
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    /// Interrupt handler entry.  Returns whether the card was interrupting.
    pub fn service_interrupt(&self) -> bool {
        self.device.service_interrupt()
    }

    /// A deadline armed through [`Platform::arm_timer`] expired.
    pub fn on_timer(&self, deadline: Deadline, token: u32) {
        match deadline {
            Deadline::Reply => self.device.on_timeout(token),
            Deadline::Session => self.session.on_timeout(&self.device, token),
        }
    }

    /// Start a session exchange without waiting for it.
    pub fn session_send(&self, cmd: &SessionCommand, completion: SessionCompletion) -> Result<()> {
        self.session.send(&self.device, cmd, completion)
    }

    /// Release the oldest unread frame, returning its slot.
    pub fn consume(&self) -> Result<u32> {
        self.device.consume()
    }

    /// See [`Device::take_dropped`].
    pub fn take_dropped(&self) -> Result<()> {
        self.device.take_dropped()
    }

    /// Diagnostic snapshot, including the session.
    pub fn status(&self) -> Status {
        let mut status = self.device.status();
        status.session = Some(self.session.status());
        status
    }
}
