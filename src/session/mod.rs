//! Link session state machine
//!
//! ```text
//!           report due                      delivered, no command
//!   Idle ──────────────▶ Sending ───────────────────────▶ WaitResponse
//!    ▲ ▲                   │                                  │
//!    │ └───────────────────┘ failed / command handled         │
//!    └────────────────────────────────────────────────────────┘
//!                  window expired / command handled
//!
//!   Idle ◀──────▶ Receiving        (base station)
//! ```
//!
//! Radio power is managed here: the radio is initialised on demand and put
//! to sleep after `idle_timeout_ms` without traffic. Consecutive init, CAD
//! and receive failures escalate to a hard reset once they reach
//! `failure_threshold`.

pub mod base;
pub mod peers;
pub mod remote;
pub mod reset;

use crate::lora::{RadioError, RadioTransport};
use crate::storage::Storage;

pub use base::BaseSession;
pub use peers::{PeerInfo, PeerTable};
pub use remote::{RemoteSession, TelemetrySource};
pub use reset::ResetRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    WaitResponse,
    Receiving,
}

/// What the caller should do after a session step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Failure threshold reached; the reset record is persisted and the
    /// device should reboot
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub report_interval_ms: u64,
    pub response_window_ms: u32,
    pub rx_poll_interval_ms: u32,
    pub idle_timeout_ms: u64,
    pub failure_threshold: u8,
    /// Whole-message retries per report
    pub max_retries: u8,
    pub max_peers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        use crate::config::{session, transfer};

        Self {
            report_interval_ms: session::REPORT_INTERVAL_MS,
            response_window_ms: session::RESPONSE_WINDOW_MS,
            rx_poll_interval_ms: session::RX_POLL_INTERVAL_MS,
            idle_timeout_ms: session::IDLE_TIMEOUT_MS,
            failure_threshold: session::FAILURE_THRESHOLD,
            max_retries: transfer::MAX_RETRIES,
            max_peers: session::MAX_PEERS,
        }
    }
}

/// State, radio power and failure bookkeeping shared by both roles
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    last_activity_ms: u64,
    failures: u8,
    powered: bool,
}

impl Session {
    pub fn new(config: SessionConfig, now_ms: u64) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            last_activity_ms: now_ms,
            failures: 0,
            powered: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!("session: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Note radio traffic, postponing the idle power-down
    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    /// Milliseconds until the idle power-down, if the radio is on
    pub fn idle_remaining(&self, now_ms: u64) -> Option<u64> {
        if !self.powered {
            return None;
        }
        let idle = now_ms.saturating_sub(self.last_activity_ms);
        Some(self.config.idle_timeout_ms.saturating_sub(idle))
    }

    /// Initialise the radio unless it is already on
    pub async fn wake<R: RadioTransport>(&mut self, radio: &mut R, now_ms: u64) -> Result<(), RadioError> {
        if self.powered {
            return Ok(());
        }
        radio.init().await?;
        log::debug!("session: radio on");
        self.powered = true;
        self.touch(now_ms);
        Ok(())
    }

    /// Put the radio to sleep once it has been idle for `idle_timeout_ms`
    ///
    /// Returns whether the radio was powered down.
    pub async fn power_down_if_idle<R: RadioTransport>(&mut self, radio: &mut R, now_ms: u64) -> bool {
        if self.idle_remaining(now_ms) != Some(0) {
            return false;
        }
        if let Err(e) = radio.deinit().await {
            log::warn!("session: radio sleep failed: {}", e);
        }
        log::debug!("session: radio idle, powered down");
        self.powered = false;
        true
    }

    /// Forget the radio power state after a hardware fault so the next
    /// step re-initialises it
    pub(crate) fn radio_lost(&mut self) {
        self.powered = false;
    }

    pub fn record_success(&mut self) {
        if self.failures > 0 {
            log::debug!("session: recovered after {} failures", self.failures);
        }
        self.failures = 0;
    }

    /// Count a failure; at the threshold persist the reset record
    pub fn record_failure<S: Storage + ?Sized>(&mut self, storage: &mut S, reason: &str) -> Step {
        self.failures = self.failures.saturating_add(1);
        log::warn!(
            "session: {} ({}/{})",
            reason,
            self.failures,
            self.config.failure_threshold
        );
        if self.failures < self.config.failure_threshold {
            return Step::Continue;
        }

        match ResetRecord::record(storage, reason) {
            Ok(record) => log::error!(
                "session: failure threshold reached, reset #{} ({})",
                record.reboot_count,
                reason
            ),
            Err(e) => log::error!("session: failure threshold reached, reset record lost: {}", e),
        }
        Step::Reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mock::MockClock;
    use crate::lora::mock::MockRadio;
    use crate::storage::MemoryStorage;
    use futures::executor::block_on;

    fn config() -> SessionConfig {
        SessionConfig {
            idle_timeout_ms: 1_000,
            failure_threshold: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_wake_is_idempotent() {
        let mut radio = MockRadio::new(MockClock::new());
        let mut session = Session::new(config(), 0);

        block_on(async {
            session.wake(&mut radio, 0).await.unwrap();
            session.wake(&mut radio, 10).await.unwrap();
        });
        assert_eq!(radio.init_calls(), 1);
        assert!(session.is_powered());
    }

    #[test]
    fn test_power_down_after_idle_timeout() {
        let mut radio = MockRadio::new(MockClock::new());
        let mut session = Session::new(config(), 0);

        block_on(async {
            session.wake(&mut radio, 0).await.unwrap();
            session.touch(500);
            assert!(!session.power_down_if_idle(&mut radio, 1_499).await);
            assert_eq!(session.idle_remaining(1_499), Some(1));
            assert!(session.power_down_if_idle(&mut radio, 1_500).await);
        });
        assert_eq!(radio.deinit_calls(), 1);
        assert!(!radio.is_powered());
        assert_eq!(session.idle_remaining(2_000), None);
    }

    #[test]
    fn test_failures_escalate_to_reset() {
        let mut storage = MemoryStorage::new();
        let mut session = Session::new(config(), 0);

        assert_eq!(session.record_failure(&mut storage, "cad failed"), Step::Continue);
        session.record_success();
        assert_eq!(session.record_failure(&mut storage, "cad failed"), Step::Continue);
        assert_eq!(session.record_failure(&mut storage, "cad failed"), Step::Continue);
        assert_eq!(session.record_failure(&mut storage, "radio init failed"), Step::Reset);

        let record = ResetRecord::load(&mut storage).unwrap().unwrap();
        assert_eq!(record.reboot_count, 1);
        assert_eq!(record.last_error, "radio init failed");
    }
}
