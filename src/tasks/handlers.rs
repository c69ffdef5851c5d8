//! Commands a remote unit accepts over the air
//!
//! Handlers only hand work to the owning task; they never block the radio.

use super::admin::{AdminCommand, ADMIN_CHANNEL};
use super::led::{LedCommand, DEFAULT_FLASH_MS, LED_CHANNEL};
use crate::commands::{CommandArgs, CommandError, CommandOutcome, CommandRegistry};
use core::fmt::Write;

fn send_led(command: LedCommand) -> Result<CommandOutcome, CommandError> {
    LED_CHANNEL
        .try_send(command)
        .map(|_| CommandOutcome::ok())
        .map_err(|_| CommandError::Failed)
}

fn led_on(_: &CommandArgs) -> Result<CommandOutcome, CommandError> {
    send_led(LedCommand::On)
}

fn led_off(_: &CommandArgs) -> Result<CommandOutcome, CommandError> {
    send_led(LedCommand::Off)
}

/// `led_flash()` or `led_flash(ms)`
fn led_flash(args: &CommandArgs) -> Result<CommandOutcome, CommandError> {
    let ms = if args.is_empty() {
        DEFAULT_FLASH_MS
    } else {
        args.parse::<u64>(0)?.min(10_000)
    };
    send_led(LedCommand::Flash(ms))
}

fn reboot(_: &CommandArgs) -> Result<CommandOutcome, CommandError> {
    ADMIN_CHANNEL
        .try_send(AdminCommand::Reboot)
        .map(|_| CommandOutcome::ok())
        .map_err(|_| CommandError::Failed)
}

fn uptime(_: &CommandArgs) -> Result<CommandOutcome, CommandError> {
    let mut text: heapless::String<24> = heapless::String::new();
    let _ = write!(text, "{}s", embassy_time::Instant::now().as_secs());
    Ok(CommandOutcome::with(&text))
}

/// Registry of every command this firmware runs
pub fn device_registry() -> Result<CommandRegistry, CommandError> {
    let mut registry = CommandRegistry::new();
    registry.register_command("led_on", led_on)?;
    registry.register_command("led_off", led_off)?;
    registry.register_command("led_flash", led_flash)?;
    registry.register_command("reboot", reboot)?;
    registry.register_command("uptime", uptime)?;
    Ok(registry)
}
