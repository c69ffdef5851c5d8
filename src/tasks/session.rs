//! Radio session tasks
//!
//! One task owns the radio and drives either the remote or the base state
//! machine. A [`Step::Reset`] hands over to the admin task for the reboot.

use super::admin::{AdminCommand, ADMIN_CHANNEL};
use super::led::{LedCommand, LED_CHANNEL};
use crate::clock::EmbassyClock;
use crate::lora::RadioTransport;
use crate::protocol::Reading;
use crate::session::{BaseSession, RemoteSession, Step};
use crate::storage::Storage;
use alloc::string::String;
use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Sender};

/// Command envelopes for the base to hand out, e.g. `r1:led_on()`
///
/// Intake for callers outside the radio task, such as a host console or
/// application code linked into the base image. [`base_task`] drains it
/// into the session queue before every step; this crate has no producer
/// of its own.
pub static COMMAND_CHANNEL: Channel<CriticalSectionRawMutex, String, 4> = Channel::new();

/// Type alias for the command channel sender
pub type CommandSender = Sender<'static, CriticalSectionRawMutex, String, 4>;

async fn escalate() -> ! {
    ADMIN_CHANNEL.send(AdminCommand::FailureReset).await;
    loop {
        embassy_time::Timer::after(embassy_time::Duration::from_secs(1)).await;
    }
}

/// Remote unit: report telemetry and run commands from the base
pub async fn remote_task<R, S>(mut radio: R, mut session: RemoteSession<S>)
where
    R: RadioTransport,
    S: Storage,
{
    let mut clock = EmbassyClock;
    let mut seq = 0u32;
    let mut source = || {
        seq = seq.wrapping_add(1);
        let reading = Reading {
            uptime_ms: embassy_time::Instant::now().as_millis(),
            seq,
            ..Default::default()
        };
        let _ = LED_CHANNEL.try_send(LedCommand::Flash(super::led::DEFAULT_FLASH_MS));
        reading.to_json()
    };

    log::info!("session: remote {} starting", session.endpoint().unit_id());
    loop {
        if session.step(&mut radio, &mut clock, &mut source).await == Step::Reset {
            escalate().await;
        }
    }
}

/// Base station: receive reports and hand out queued commands
pub async fn base_task<R, S>(mut radio: R, mut session: BaseSession<S>)
where
    R: RadioTransport,
    S: Storage,
{
    let mut clock = EmbassyClock;
    let mut sink = |unit_id: &str, payload: &[u8]| {
        let _ = LED_CHANNEL.try_send(LedCommand::Flash(super::led::DEFAULT_FLASH_MS));
        match Reading::from_json(payload) {
            Some(reading) => log::info!(
                "telemetry: {} #{} up {} ms, {:?} C, {:?} %, {:?} hPa",
                unit_id,
                reading.seq,
                reading.uptime_ms,
                reading.temperature_c,
                reading.humidity_pct,
                reading.pressure_hpa
            ),
            None => log::info!("telemetry: {} sent {} bytes", unit_id, payload.len()),
        }
    };

    log::info!("session: base {} listening", session.endpoint().unit_id());
    loop {
        let queued: Vec<String> = core::iter::from_fn(|| COMMAND_CHANNEL.try_receive().ok()).collect();
        for envelope in queued {
            if let Err(e) = session.queue_command(&envelope) {
                log::warn!("session: rejected '{}': {}", envelope, e);
            }
        }

        if session.step(&mut radio, &mut clock, &mut sink).await == Step::Reset {
            escalate().await;
        }
    }
}
