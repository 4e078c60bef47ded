//! Frame buffer flow control.
//!
//! In quiet-transfer mode the card writes data frames straight into a
//! circular buffer of `capacity` fixed-size slots in host memory, and reports
//! its write position (the head) with [`crate::command::QTI`] messages.  The
//! consumer reads from the tail.  The card is told how far the consumer has
//! got with a grant, sent by the priority task once more than a quarter of
//! the buffer is unread since the last grant.
//!
//! The card also reports a running count of frames it had to drop because the
//! buffer was full.  Changes are surfaced once each through
//! [`Device::take_dropped`] and the [`FrameObserver`], and never stop the
//! stream.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::sync::Arc;
use core::fmt;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::command::Message;
use crate::device::{Device, MessageHandler, StateFlags};
use crate::{Error, Platform, Result};

/// Slots are aligned to this many bytes.
pub const FRAME_ALIGN: u32 = 1024;

/// Frame buffer bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    /// Bytes of frame data per slot
    pub(super) data_size: u32,
    /// Bytes per slot
    pub(super) frame_size: u32,
    /// Number of slots
    pub(super) capacity: u32,
    pub(super) head: u32,
    pub(super) tail: u32,
    /// Tail last announced to the card
    pub(super) last_grant: u32,
    /// Head when the last grant was sent
    pub(super) grant_head: u32,
    /// Last drop counter reported by the card
    pub(super) card_drops: u32,
    /// Total frames dropped since configuration
    pub(super) dropped: u32,
    /// Frames dropped but not yet reported by [`Device::take_dropped`]
    pub(super) unreported: u32,
    pub(super) base_busaddr: u32,
}

impl FrameBuffer {
    pub const fn new() -> Self {
        Self {
            data_size: 0,
            frame_size: 0,
            capacity: 0,
            head: 0,
            tail: 0,
            last_grant: 0,
            grant_head: 0,
            card_drops: 0,
            dropped: 0,
            unreported: 0,
            base_busaddr: 0,
        }
    }

    /// Lay out `capacity` slots for frames of `data_size` bytes, and reset
    /// all indices and counters.  A data size of 0 means one aligned slot.
    pub fn configure(&mut self, data_size: u32, capacity: u32, base_busaddr: u32) -> Result<()> {
        if capacity == 0 {
            return Err(Error::InvalidArgument);
        }
        let data_size = if data_size == 0 {
            FRAME_ALIGN
        } else {
            data_size
        };
        let frame_size = data_size
            .checked_next_multiple_of(FRAME_ALIGN)
            .ok_or(Error::InvalidArgument)?;

        *self = Self {
            data_size,
            frame_size,
            capacity,
            base_busaddr,
            ..Self::new()
        };
        Ok(())
    }

    /// Slots written by the card beyond the last granted tail.
    pub fn unread_since_grant(&self) -> u32 {
        self.distance(self.last_grant, self.head)
    }

    // Slots from `from` forward to `to`
    fn distance(&self, from: u32, to: u32) -> u32 {
        if self.capacity == 0 {
            return 0;
        }
        (to + self.capacity - from) % self.capacity
    }

    /// Record the card's new head.  Returns whether a grant is due.
    ///
    /// A grant is due once more than a quarter of the buffer is unread past
    /// the last granted tail, and the head has moved more than a quarter
    /// since the last grant was sent.
    pub fn advance_head(&mut self, head: u32) -> Result<bool> {
        if head >= self.capacity {
            return Err(Error::ProtocolViolation);
        }
        self.head = head;
        let quarter = self.capacity / 4;
        Ok(self.unread_since_grant() > quarter && self.distance(self.grant_head, head) > quarter)
    }

    /// A grant of `tail` has been sent at the current head.
    pub fn record_grant(&mut self, tail: u32) {
        self.last_grant = tail;
        self.grant_head = self.head;
    }

    /// Record the card's drop counter.  Returns the number of frames newly
    /// dropped, if any.
    pub fn record_drops(&mut self, drops: u32) -> Option<u32> {
        if drops == self.card_drops {
            return None;
        }
        let delta = drops.wrapping_sub(self.card_drops);
        self.card_drops = drops;
        self.dropped = self.dropped.wrapping_add(delta);
        self.unreported = self.unreported.wrapping_add(delta);
        Some(delta)
    }

    /// Release the slot at the tail.  Returns its index.
    pub fn consume(&mut self) -> Result<u32> {
        if self.capacity == 0 || self.tail == self.head {
            return Err(Error::NoData);
        }
        let slot = self.tail;
        self.tail = (self.tail + 1) % self.capacity;
        Ok(slot)
    }

    pub fn status(&self) -> FrameStatus {
        FrameStatus {
            data_size: self.data_size,
            frame_size: self.frame_size,
            capacity: self.capacity,
            head: self.head,
            tail: self.tail,
            last_grant: self.last_grant,
            dropped: self.dropped,
            base_busaddr: self.base_busaddr,
        }
    }
}

/// Frame buffer geometry and indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus {
    pub data_size: u32,
    pub frame_size: u32,
    pub capacity: u32,
    pub head: u32,
    pub tail: u32,
    pub last_grant: u32,
    pub dropped: u32,
    pub base_busaddr: u32,
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.capacity == 0 {
            return write!(f, "unconfigured");
        }
        write!(
            f,
            "{} x {} bytes ({} data) at {:#010x}, head {} tail {} granted {} dropped {}",
            self.capacity,
            self.frame_size,
            self.data_size,
            self.base_busaddr,
            self.head,
            self.tail,
            self.last_grant,
            self.dropped
        )
    }
}

/// Frame buffer events, delivered outside the device lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// The card has written up to, not including, slot `head`
    Available { head: u32 },
    /// The card dropped this many frames since the last report
    Dropped(u32),
    /// The card reported a head outside the buffer.  It was ignored
    BadHead(u32),
}

/// Frame consumer notification.  Called from interrupt context.
pub trait FrameObserver: Send + Sync {
    fn frame_event(&self, event: FrameEvent);
}

impl<P: Platform> Device<P> {
    /// Reset the frame buffer to a new geometry.  Returns its status.
    ///
    /// Only the host side bookkeeping; [`crate::card::Card::configure_frames`]
    /// also informs the card.
    pub fn reset_frames(&self, data_size: u32, capacity: u32, base_busaddr: u32) -> Result<FrameStatus> {
        let mut state = self.state.lock();
        state.frames.configure(data_size, capacity, base_busaddr)?;
        let status = state.frames.status();
        debug!("card{}: frames {}", self.config.card, status);
        Ok(status)
    }

    /// The card reports it has written up to slot `head`.
    ///
    /// Fails with [`Error::ProtocolViolation`] if `head` is out of range.
    pub fn on_head_advance(&self, head: u32) -> Result<()> {
        let (result, observer) = {
            let mut state = self.state.lock();
            let result = state.frames.advance_head(head);
            match result {
                Ok(grant) => {
                    if grant && !state.pending.contains(StateFlags::SEND_GRANT) {
                        trace!("card{}: grant due at head {head}", self.config.card);
                        state.pending |= StateFlags::SEND_GRANT;
                        self.schedule_locked(&mut state);
                    }
                }
                Err(_) => {
                    state.counters.violations = state.counters.violations.wrapping_add(1);
                    error!(
                        "card{}: head {head} outside buffer of {}",
                        self.config.card, state.frames.capacity
                    );
                }
            }
            (result, state.observer.clone())
        };

        let event = match result {
            Ok(_) => FrameEvent::Available { head },
            Err(_) => FrameEvent::BadHead(head),
        };
        if let Some(observer) = observer {
            observer.frame_event(event);
        }
        result.map(|_| ())
    }

    /// Quiet-transfer inform: the card's head, its view of the tail, and its
    /// drop counter.
    pub fn on_qt_inform(&self, head: u32, tail: u32, drops: u32) -> Result<()> {
        let (dropped, observer) = {
            let mut state = self.state.lock();
            trace!(
                "card{}: inform head {head} tail {tail} drops {drops}",
                self.config.card
            );
            let dropped = state.frames.record_drops(drops);
            if let Some(n) = dropped {
                error!(
                    "card{}: {n} frames dropped ({} total)",
                    self.config.card, state.frames.dropped
                );
            }
            (dropped, state.observer.clone())
        };

        if let (Some(n), Some(observer)) = (dropped, observer) {
            observer.frame_event(FrameEvent::Dropped(n));
        }
        self.on_head_advance(head)
    }

    /// Release the oldest unread frame.  Returns its slot index, or
    /// [`Error::NoData`] if the buffer is empty.
    pub fn consume(&self) -> Result<u32> {
        self.state.lock().frames.consume()
    }

    /// Surface dropped frames.  Returns [`Error::FramesDropped`] once for
    /// each batch of drops reported by the card.
    pub fn take_dropped(&self) -> Result<()> {
        let mut state = self.state.lock();
        match core::mem::take(&mut state.frames.unreported) {
            0 => Ok(()),
            n => Err(Error::FramesDropped(n)),
        }
    }

    pub fn frames(&self) -> FrameStatus {
        self.state.lock().frames.status()
    }

    /// Install or remove the frame consumer's observer.
    pub fn set_frame_observer(&self, observer: Option<Arc<dyn FrameObserver>>) {
        self.state.lock().observer = observer;
    }
}

/// Routes `QTI` messages to the frame buffer.
pub struct FrameInformHandler;

impl<P: Platform> MessageHandler<P> for FrameInformHandler {
    fn handle(&self, device: &Device<P>, message: &Message) {
        if let Message::QtInform { head, tail, drops } = *message {
            // Logged, counted and passed to the observer
            let _ = device.on_qt_inform(head, tail, drops);
        }
    }
}
