//! Randomized exponential backoff for a busy channel
//!
//! The contention window doubles with every busy CAD result, from `min_ms`
//! up to `max_ms`; the actual wait is drawn uniformly from
//! `min_ms..=window` so two nodes that collided do not retry in lockstep.

use super::TransferError;
use crate::clock::Clock;
use crate::lora::{ChannelState, RadioError, RadioTransport};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct Backoff {
    rng: SmallRng,
    min_ms: u32,
    max_ms: u32,
}

impl Backoff {
    pub fn new(seed: u64, min_ms: u32, max_ms: u32) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    /// Backoff bounds from `config::session`
    pub fn with_defaults(seed: u64) -> Self {
        use crate::config::session;
        Self::new(seed, session::BACKOFF_MIN_MS, session::BACKOFF_MAX_MS)
    }

    /// Upper bound of the window after `attempt` busy results
    pub fn window_ms(&self, attempt: u8) -> u32 {
        let factor = 1u32 << attempt.min(16);
        self.min_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// Wait before the next CAD after `attempt` busy results
    pub fn delay_ms(&mut self, attempt: u8) -> u32 {
        let window = self.window_ms(attempt);
        self.rng.gen_range(self.min_ms..=window)
    }

    /// CAD until the channel is free, backing off while it is busy
    ///
    /// Gives up with [`TransferError::ChannelBusy`] after `max_attempts`
    /// busy results; a CAD fault is reported as a hardware error.
    pub async fn wait_for_channel<R, C>(
        &mut self,
        radio: &mut R,
        clock: &mut C,
        max_attempts: u8,
    ) -> Result<(), TransferError>
    where
        R: RadioTransport,
        C: Clock,
    {
        for attempt in 0..max_attempts {
            match radio.channel_clear().await {
                ChannelState::Free => return Ok(()),
                ChannelState::Busy => {
                    let delay = self.delay_ms(attempt);
                    log::trace!("cad: channel busy, backing off {} ms", delay);
                    clock.delay_ms(delay).await;
                }
                ChannelState::Error => return Err(TransferError::Radio(RadioError::Hardware)),
            }
        }
        Err(TransferError::ChannelBusy)
    }
}
