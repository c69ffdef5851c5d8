//! LED task for non-blocking LED control
//!
//! Actuates the board LED on behalf of the `led_*` commands without
//! holding up the radio task.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use esp_hal::gpio::Output;

/// Flash length when the command gives none
pub const DEFAULT_FLASH_MS: u64 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedCommand {
    On,
    Off,
    /// Toggle for the given milliseconds, then restore
    Flash(u64),
}

/// Type alias for the LED channel sender
pub type LedSender = Sender<'static, CriticalSectionRawMutex, LedCommand, 4>;

/// Type alias for the LED channel receiver
pub type LedReceiver = Receiver<'static, CriticalSectionRawMutex, LedCommand, 4>;

/// Channel for LED commands
pub static LED_CHANNEL: Channel<CriticalSectionRawMutex, LedCommand, 4> = Channel::new();

/// Task that drives the LED (active low)
pub async fn led_task(mut led: Output<'static>, receiver: LedReceiver) {
    let mut on = false;
    led.set_high();

    loop {
        match receiver.receive().await {
            LedCommand::On => {
                on = true;
                led.set_low();
            }
            LedCommand::Off => {
                on = false;
                led.set_high();
            }
            LedCommand::Flash(ms) => {
                led.toggle();
                embassy_time::Timer::after(embassy_time::Duration::from_millis(ms)).await;
                if on {
                    led.set_low();
                } else {
                    led.set_high();
                }
            }
        }
    }
}
