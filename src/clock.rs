//! Monotonic time source and timed waits
//!
//! Every suspension point in the protocol goes through this trait so the
//! same code runs on the embassy executor and under a virtual clock in tests.

use core::future::Future;

/// Millisecond clock with an async delay
pub trait Clock {
    /// Milliseconds since an arbitrary, fixed origin
    fn now_ms(&self) -> u64;

    /// Suspend the calling task for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32) -> impl Future<Output = ()>;
}

/// Clock backed by the embassy time driver
#[cfg(feature = "embedded")]
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbassyClock;

#[cfg(feature = "embedded")]
impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        embassy_time::Instant::now().as_millis()
    }

    async fn delay_ms(&mut self, ms: u32) {
        embassy_time::Timer::after(embassy_time::Duration::from_millis(ms as u64)).await;
    }
}

#[cfg(test)]
pub mod mock {
    //! Virtual clock for testing

    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Shared virtual clock
    ///
    /// Clones observe the same time, so a mock radio can advance the clock
    /// the session is reading from.
    #[derive(Debug, Clone, Default)]
    pub struct MockClock {
        now: Rc<Cell<u64>>,
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn starting_at(ms: u64) -> Self {
            let clock = Self::new();
            clock.now.set(ms);
            clock
        }

        pub fn advance(&self, ms: u64) {
            self.now.set(self.now.get() + ms);
        }
    }

    impl Clock for MockClock {
        fn now_ms(&self) -> u64 {
            self.now.get()
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.advance(ms as u64);
        }
    }

    #[test]
    fn test_clones_share_time() {
        let mut a = MockClock::starting_at(1_000);
        let b = a.clone();

        futures::executor::block_on(a.delay_ms(250));
        assert_eq!(b.now_ms(), 1_250);
    }
}
