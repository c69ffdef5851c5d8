//! Admin task for system commands (reboot, etc.)

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver};
use embassy_time::{Duration, Timer};

/// Admin command types
#[derive(Clone, Copy, Debug)]
pub enum AdminCommand {
    /// Operator-requested restart
    Reboot,
    /// Session failure threshold reached; the reset record is already stored
    FailureReset,
}

/// Channel for admin commands
pub static ADMIN_CHANNEL: Channel<CriticalSectionRawMutex, AdminCommand, 4> = Channel::new();

/// Type alias for the admin command receiver
pub type AdminReceiver = Receiver<'static, CriticalSectionRawMutex, AdminCommand, 4>;

fn reboot() -> ! {
    esp_hal::system::software_reset()
}

/// Admin task that handles system commands
///
/// Listens on ADMIN_CHANNEL and executes each command.
pub async fn admin_task(receiver: AdminReceiver) {
    loop {
        match receiver.receive().await {
            AdminCommand::Reboot => log::warn!("admin: rebooting"),
            AdminCommand::FailureReset => log::error!("admin: radio wedged, resetting"),
        }
        // Allow the log line and any command result to go out
        Timer::after(Duration::from_millis(500)).await;
        reboot();
    }
}
