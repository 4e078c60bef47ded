//! Card operations that wait on the card.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::sync::Arc;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::card::Card;
use crate::command::*;
use crate::device::{AsyncDelay, Completion, Device, FrameStatus, Request, Status};
use crate::regs::{HostControl, HostStatus, RegisterIo};
use crate::session::{SESSION_WORDS, SessionCommand, SessionMode, SessionReply, SharedBuffer};
use crate::{Error, Platform, Result};

/// Async command surface of a card, for the character-device layer.
#[async_trait(?Send)]
pub trait Commander {
    /// Send a command to the card and wait for its reply.
    async fn command(&self, cmd: Command) -> Result<Reply>;

    /// Run a session exchange and wait for the electronics' reply.
    async fn session_command(&self, cmd: &SessionCommand) -> Result<SessionReply>;

    fn status(&self) -> Status;
}

fn quick_done<P: Platform>() -> Completion<P> {
    Box::new(|_: &Device<P>, _: Result<Reply>| ())
}

impl<P: Platform, D: AsyncDelay> Card<P, D> {
    /// Send a command and wait for its reply, which may be a NAK.
    pub async fn command(&self, cmd: Command) -> Result<Reply> {
        self.device
            .blocking_send::<D>(cmd, self.config.command_timeout_us)
            .await
    }

    /// Send a command that must be ACKed.
    pub async fn admin(&self, cmd: Command) -> Result<Reply> {
        self.command(cmd)
            .await
            .and_then(Reply::ack)
            .inspect_err(|e| {
                error!(
                    "card{}: {:#08x} {:?} failed: {e}",
                    self.device.card(),
                    cmd.code,
                    cmd.args
                )
            })
    }

    fn quick(&self, code: u32) -> Result<()> {
        self.device
            .submit(Command::bare(code), Request::Normal, quick_done())
    }

    /// Bring the card up: reset it, identify its firmware and configure the
    /// host interface to match.  Returns the session protocol selected.
    ///
    /// Fails with [`Error::Unsupported`] for U0107 firmware, which speaks a
    /// different protocol.
    pub async fn probe(&self) -> Result<SessionMode> {
        let card = self.device.card();

        // Non-maskable vectors until the version is known
        self.device.set_firmware(0, legacy_version_string());

        self.quick(INT_RST)?;
        self.quick(INT_DON)?;
        self.device.set_control(HostControl::PCI_MODE_BASE);
        self.quick(SYS_RST)?;

        // U0107 answers HF2 with HF4
        self.device
            .set_control(HostControl::PCI_MODE_BASE | HostControl::HF2);
        D::delay().await;
        let u0107 = self
            .device
            .platform()
            .registers()
            .status()
            .contains(HostStatus::HF4);
        self.device.set_control(HostControl::PCI_MODE_BASE);
        if u0107 {
            self.device.set_firmware(U0107, version_string(U0107));
            error!("card{card}: U0107 handshake, firmware not supported");
            return Err(Error::Unsupported);
        }

        let reply = self.command(Command::bare(VER)).await?;
        if reply.is_ack() {
            self.device.set_firmware(reply.data, version_string(reply.data));
        } else {
            self.device.set_firmware(U0103, legacy_version_string());
        }
        let version = self.device.version();

        if version >= U0105 {
            self.device
                .set_control(HostControl::PCI_MODE_BASE | HostControl::HANDSHAKE);
        }

        if let Some(burst) = self.config.burst_size {
            self.set_burst(version, burst).await?;
        }

        let mode = if version >= U0105 {
            self.enable_quiet_replies().await?;
            SessionMode::OnePhase
        } else {
            SessionMode::TwoPhase
        };
        let mode = self.session.set_mode(mode);
        info!("card{card}: probed, {:?} sessions", mode);
        Ok(mode)
    }

    async fn set_burst(&self, version: u32, burst: u8) -> Result<()> {
        if burst <= 4 {
            error!("card{}: bad burst size {burst}", self.device.card());
            return Err(Error::InvalidArgument);
        }
        if version < U0106 {
            warn!(
                "card{}: can't set burst size on {:#08x} firmware",
                self.device.card(),
                version
            );
            return Ok(());
        }
        self.admin(Command::qt(QT_BURST, u32::from(burst) - 4, 0))
            .await
            .map(|_| ())
    }

    async fn enable_quiet_replies(&self) -> Result<()> {
        let busaddr = self.device.platform().buffer().reply_busaddr();
        self.admin(Command::qt(QT_RPENAB, 0, 0)).await?;
        self.admin(Command::qt(QT_RPSIZE, (SESSION_WORDS * 4) as u32, 0))
            .await?;
        self.admin(Command::qt(QT_RPBASE, busaddr & 0xFFFF, busaddr >> 16 & 0xFFFF))
            .await?;
        self.admin(Command::qt(QT_RPENAB, 1, 0)).await?;
        debug!(
            "card{}: quiet replies to {busaddr:#010x}",
            self.device.card()
        );
        Ok(())
    }

    /// Lay out the frame buffer and tell the card about it.  Frames are
    /// disabled while the card is reconfigured.
    pub async fn configure_frames(
        &self,
        data_size: u32,
        capacity: u32,
        base_busaddr: u32,
    ) -> Result<FrameStatus> {
        self.admin(Command::qt(QT_ENABLE, 0, 0)).await?;
        let frames = self.device.reset_frames(data_size, capacity, base_busaddr)?;

        let steps = [
            Command::qt(QT_DELTA, frames.frame_size, 0),
            Command::qt(QT_NUMBER, frames.capacity, 0),
            Command::qt(QT_INFORM, self.config.inform_interval, 0),
            Command::qt(QT_PERIOD, self.config.inform_period, 0),
            Command::qt(QT_SIZE, frames.data_size, 0),
            Command::qt(QT_TAIL, frames.tail, 0),
            Command::qt(QT_HEAD, frames.head, 0),
            Command::qt(QT_DROPS, 0, 0),
            Command::qt(QT_BASE, base_busaddr & 0xFFFF, base_busaddr >> 16 & 0xFFFF),
            Command::qt(QT_ENABLE, 1, 0),
        ];
        for cmd in steps {
            self.admin(cmd).await?;
        }
        info!("card{}: frames {}", self.device.card(), frames);
        Ok(frames)
    }

    /// Run a session exchange and wait for the reply.
    ///
    /// Retries while another exchange or the device is busy.  Returns
    /// [`Error::Timeout`] if no reply arrives within the session deadline.
    pub async fn session_request(&self, cmd: &SessionCommand) -> Result<SessionReply> {
        let platform = self.device.platform();
        let deadline = platform.now_us() + u64::from(self.config.session_timeout_us);
        let reply: Arc<Mutex<Option<Result<SessionReply>>>> = Arc::new(Mutex::new(None));

        loop {
            let slot = reply.clone();
            let completion = Box::new(move |result: Result<SessionReply>| {
                *slot.lock() = Some(result);
            });
            match self.session.send(&self.device, cmd, completion) {
                Ok(()) => break,
                Err(Error::Busy) if platform.now_us() < deadline => D::delay().await,
                Err(e) => return Err(e),
            }
        }

        loop {
            let result = reply.lock().take();
            if let Some(result) = result {
                return result;
            }
            if platform.now_us() >= deadline {
                warn!(
                    "card{}: gave up waiting for session reply to {:#010x}",
                    self.device.card(),
                    cmd.command
                );
                return Err(Error::Timeout);
            }
            D::delay().await;
        }
    }

    /// Undo probe ahead of the card being released.
    pub async fn remove(&self) {
        if self.session.mode() == Some(SessionMode::OnePhase) {
            if let Err(e) = self.admin(Command::qt(QT_RPENAB, 0, 0)).await {
                warn!(
                    "card{}: failed to disable quiet replies: {e}",
                    self.device.card()
                );
            }
        }
        self.device.set_control(HostControl::PCI_MODE_BASE);
        info!("card{}: removed", self.device.card());
    }
}

#[async_trait(?Send)]
impl<P: Platform, D: AsyncDelay> Commander for Card<P, D> {
    async fn command(&self, cmd: Command) -> Result<Reply> {
        Card::command(self, cmd).await
    }

    async fn session_command(&self, cmd: &SessionCommand) -> Result<SessionReply> {
        self.session_request(cmd).await
    }

    fn status(&self) -> Status {
        Card::status(self)
    }
}
