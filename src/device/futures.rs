//! Waiting for replies from async callers.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::sync::Arc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::command::{Command, Reply};
use crate::device::{Device, Request};
use crate::{Error, Platform, Result};

/// Yield delay for async polling loops.
///
/// Application must provide an implementation of this trait so that callers
/// waiting on the card can yield.  Keeps this crate free of any specific
/// async runtime.
///
/// Example:
///
/// ```ignore
/// use embassy_time::{Duration, Timer};
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay() {
///         Timer::after(Duration::from_micros(500)).await;
///     }
/// }
/// ```
pub trait AsyncDelay {
    fn delay() -> impl Future<Output = ()>;
}

// Marks the device's single blocking caller slot taken until dropped
struct BlockingSlot<'a, P: Platform> {
    device: &'a Device<P>,
}

impl<'a, P: Platform> BlockingSlot<'a, P> {
    fn claim(device: &'a Device<P>) -> Result<Self> {
        let mut state = device.state.lock();
        if state.blocking {
            return Err(Error::Busy);
        }
        state.blocking = true;
        Ok(Self { device })
    }
}

impl<P: Platform> Drop for BlockingSlot<'_, P> {
    fn drop(&mut self) {
        self.device.state.lock().blocking = false;
    }
}

impl<P: Platform> Device<P> {
    /// Send a command and wait for its reply.
    ///
    /// Submits as an ordinary command, retrying while the device is busy.
    /// Returns [`Error::Busy`] if the command could not be sent within
    /// `timeout_us`, or if another caller is already waiting here.  Returns
    /// [`Error::Timeout`] if it was sent but neither a reply nor the device's
    /// own reply timeout arrived in time.
    ///
    /// A refused command is returned as a reply; use [`Reply::ack`] to treat
    /// it as an error.
    pub async fn blocking_send<D: AsyncDelay>(&self, cmd: Command, timeout_us: u32) -> Result<Reply> {
        let _slot = BlockingSlot::claim(self)?;
        let deadline = self.platform.now_us() + u64::from(timeout_us);
        let reply: Arc<Mutex<Option<Result<Reply>>>> = Arc::new(Mutex::new(None));

        loop {
            let slot = reply.clone();
            let completion = Box::new(move |_: &Device<P>, result: Result<Reply>| {
                *slot.lock() = Some(result);
            });
            match self.submit(cmd, Request::Normal, completion) {
                Ok(()) => break,
                Err(Error::Busy) if self.platform.now_us() < deadline => D::delay().await,
                Err(e) => {
                    debug!(
                        "card{}: blocking send of {:#08x} failed: {e}",
                        self.config.card, cmd.code
                    );
                    return Err(e);
                }
            }
        }

        loop {
            let result = reply.lock().take();
            if let Some(result) = result {
                return result;
            }
            if self.platform.now_us() >= deadline {
                warn!(
                    "card{}: gave up waiting for reply to {:#08x}",
                    self.config.card, cmd.code
                );
                return Err(Error::Timeout);
            }
            D::delay().await;
        }
    }
}
