//! Remote unit: periodic telemetry reports and command execution

use super::{Session, SessionConfig, SessionState, Step};
use crate::clock::Clock;
use crate::commands::CommandRegistry;
use crate::lora::{ErrorKind, RadioError, RadioTransport};
use crate::protocol::{Frame, FrameType};
use crate::storage::{Storage, StorageError};
use crate::transfer::{Backoff, Delivery, Endpoint, MidGenerator, Sender, TransferConfig, TransferError};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

/// Produces the payload of the next report
pub trait TelemetrySource {
    fn sample(&mut self) -> Vec<u8>;
}

impl<F> TelemetrySource for F
where
    F: FnMut() -> Vec<u8>,
{
    fn sample(&mut self) -> Vec<u8> {
        self()
    }
}

pub struct RemoteSession<S> {
    session: Session,
    endpoint: Endpoint<S>,
    sender: Sender,
    registry: CommandRegistry,
    next_report_ms: u64,
    last_delivery: Option<Delivery>,
}

impl<S: Storage> RemoteSession<S> {
    /// Session reporting to `base_id`; the first report is due immediately
    pub fn new(
        base_id: &str,
        config: SessionConfig,
        transfer: TransferConfig,
        mut endpoint: Endpoint<S>,
        registry: CommandRegistry,
        backoff: Backoff,
        now_ms: u64,
    ) -> Result<Self, StorageError> {
        let mids = MidGenerator::load(endpoint.storage())?;
        Ok(Self {
            session: Session::new(config, now_ms),
            sender: Sender::new(base_id, transfer, mids, backoff),
            endpoint,
            registry,
            next_report_ms: now_ms,
            last_delivery: None,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn endpoint(&mut self) -> &mut Endpoint<S> {
        &mut self.endpoint
    }

    /// Outcome of the most recent report
    pub fn last_delivery(&self) -> Option<&Delivery> {
        self.last_delivery.as_ref()
    }

    pub fn next_report_ms(&self) -> u64 {
        self.next_report_ms
    }

    /// Advance the state machine by one step
    pub async fn step<R, C, T>(&mut self, radio: &mut R, clock: &mut C, source: &mut T) -> Step
    where
        R: RadioTransport,
        C: Clock,
        T: TelemetrySource + ?Sized,
    {
        match self.session.state() {
            SessionState::Idle => self.idle(radio, clock).await,
            SessionState::Sending => self.send(radio, clock, source).await,
            SessionState::WaitResponse => self.wait_response(radio, clock).await,
            SessionState::Receiving => {
                self.session.transition(SessionState::Idle);
                Step::Continue
            }
        }
    }

    async fn idle<R, C>(&mut self, radio: &mut R, clock: &mut C) -> Step
    where
        R: RadioTransport,
        C: Clock,
    {
        let now = clock.now_ms();
        if now >= self.next_report_ms {
            self.session.transition(SessionState::Sending);
            return Step::Continue;
        }

        self.session.power_down_if_idle(radio, now).await;
        let mut wait = self.next_report_ms - now;
        if let Some(remaining) = self.session.idle_remaining(now) {
            wait = wait.min(remaining.max(1));
        }
        clock.delay_ms(wait.min(u32::MAX as u64) as u32).await;
        Step::Continue
    }

    async fn send<R, C, T>(&mut self, radio: &mut R, clock: &mut C, source: &mut T) -> Step
    where
        R: RadioTransport,
        C: Clock,
        T: TelemetrySource + ?Sized,
    {
        if let Err(e) = self.session.wake(radio, clock.now_ms()).await {
            let reason = format!("radio init failed: {}", e);
            return self.session.record_failure(self.endpoint.storage(), &reason);
        }

        // A busy channel keeps the report in Sending; only a CAD fault counts
        match self.sender.wait_for_channel(radio, clock).await {
            Ok(()) => {}
            Err(TransferError::ChannelBusy) => {
                let rssi = radio.rssi().await;
                log::debug!("session: channel busy at {} dBm, report deferred", rssi);
                return Step::Continue;
            }
            Err(e) => {
                self.session.radio_lost();
                let reason = format!("cad failed: {}", e);
                return self.session.record_failure(self.endpoint.storage(), &reason);
            }
        }

        let payload = source.sample();
        let max_retries = self.session.config().max_retries;
        let delivery = self
            .sender
            .deliver(radio, clock, &mut self.endpoint, &payload, max_retries)
            .await;

        let now = clock.now_ms();
        self.session.touch(now);
        self.next_report_ms = now + self.session.config().report_interval_ms;

        let step = match delivery.fault {
            Some(TransferError::Radio(e)) if e.kind() == ErrorKind::Wedge => {
                self.session.radio_lost();
                let reason = format!("send failed: {}", e);
                self.session.record_failure(self.endpoint.storage(), &reason)
            }
            _ => {
                self.session.record_success();
                Step::Continue
            }
        };

        let mut handled = false;
        if let Some(command) = delivery.command.as_deref() {
            handled |= self.run_command(radio, clock, delivery.mid, command).await;
        }
        for frame in &delivery.control {
            if let (FrameType::Cmd, Some(command)) = (frame.kind, frame.cmd.as_deref()) {
                handled |= self.run_command(radio, clock, frame.mid, command).await;
            }
        }

        let next = if delivery.delivered && !handled {
            SessionState::WaitResponse
        } else {
            SessionState::Idle
        };
        self.session.transition(next);
        self.last_delivery = Some(delivery);
        step
    }

    async fn wait_response<R, C>(&mut self, radio: &mut R, clock: &mut C) -> Step
    where
        R: RadioTransport,
        C: Clock,
    {
        let deadline = clock.now_ms() + self.session.config().response_window_ms as u64;

        loop {
            let now = clock.now_ms();
            if now >= deadline {
                break;
            }
            let remaining = (deadline - now).min(u32::MAX as u64) as u32;

            match radio.recv(remaining).await {
                Ok(packet) => {
                    let frame = match self.endpoint.open(&packet.data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::trace!("session: ignored frame: {}", e);
                            continue;
                        }
                    };
                    if let (FrameType::Cmd, Some(command)) = (frame.kind, frame.cmd.as_deref()) {
                        self.session.touch(clock.now_ms());
                        if self.run_command(radio, clock, frame.mid, command).await {
                            break;
                        }
                    }
                }
                Err(RadioError::Timeout) => break,
                Err(e) if e.kind() == ErrorKind::Retry => continue,
                Err(e) => {
                    self.session.transition(SessionState::Idle);
                    self.session.radio_lost();
                    let reason = format!("receive failed: {}", e);
                    return self.session.record_failure(self.endpoint.storage(), &reason);
                }
            }
        }

        self.session.record_success();
        self.session.transition(SessionState::Idle);
        Step::Continue
    }

    /// Run `command` if it targets this unit and report the result to the
    /// base; returns whether it was for us
    async fn run_command<R, C>(&mut self, radio: &mut R, clock: &mut C, mid: u64, command: &str) -> bool
    where
        R: RadioTransport,
        C: Clock,
    {
        let result = match self.registry.execute(self.endpoint.unit_id(), command) {
            None => return false,
            Some(Ok(outcome)) => String::from(outcome.text()),
            Some(Err(e)) => format!("error: {}", e),
        };

        let reply = Frame::command_result(self.endpoint.unit_id(), self.sender.peer(), mid, &result);
        let bytes = match self.endpoint.seal(reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("session: cannot seal command result: {}", e);
                return true;
            }
        };
        let sent = match self.sender.wait_for_channel(radio, clock).await {
            Ok(()) => radio.send(&bytes).await.map_err(TransferError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            log::warn!("session: command result for {} not sent: {}", mid, e);
        }
        true
    }
}
