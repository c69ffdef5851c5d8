//! Base station: receives reports, acknowledges them and hands out commands

use super::{PeerTable, Session, SessionConfig, SessionState, Step};
use crate::clock::Clock;
use crate::commands::{CommandError, CommandParser, Target};
use crate::lora::{ErrorKind, RadioError, RadioTransport};
use crate::protocol::{Frame, FrameType};
use crate::storage::{Storage, StorageError};
use crate::transfer::{Backoff, Endpoint, MessageSink, Receiver, TransferConfig, TransferError};
use alloc::format;
use alloc::vec::Vec;

pub struct BaseSession<S> {
    session: Session,
    endpoint: Endpoint<S>,
    receiver: Receiver,
    peers: PeerTable,
    backoff: Backoff,
    max_cad_attempts: u8,
    parser: CommandParser,
}

impl<S: Storage> BaseSession<S> {
    pub fn new(
        config: SessionConfig,
        transfer: TransferConfig,
        mut endpoint: Endpoint<S>,
        backoff: Backoff,
        now_ms: u64,
    ) -> Result<Self, StorageError> {
        let receiver = Receiver::with_archive(transfer, endpoint.storage())?;
        Ok(Self {
            session: Session::new(config, now_ms),
            peers: PeerTable::new(config.max_peers),
            endpoint,
            receiver,
            backoff,
            max_cad_attempts: transfer.max_cad_attempts,
            parser: CommandParser::new(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn receiver(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    pub fn endpoint(&mut self) -> &mut Endpoint<S> {
        &mut self.endpoint
    }

    /// Queue a command envelope for delivery on the target's next final ack
    ///
    /// A broadcast is queued once per known remote. Returns how many copies
    /// were queued.
    pub fn queue_command(&mut self, text: &str) -> Result<usize, CommandError> {
        let envelope = self.parser.parse(text)?;
        let text = text.trim();

        let queued = match &envelope.target {
            Target::Unit(unit_id) => usize::from(self.receiver.queue_command(unit_id, text)),
            Target::Broadcast => {
                let mut queued = 0;
                for peer in self.peers.iter() {
                    if self.receiver.queue_command(&peer.unit_id, text) {
                        queued += 1;
                    }
                }
                queued
            }
        };
        log::info!("session: queued '{}' for {} remote(s)", text, queued);
        Ok(queued)
    }

    /// Advance the state machine by one step
    pub async fn step<R, C, K>(&mut self, radio: &mut R, clock: &mut C, sink: &mut K) -> Step
    where
        R: RadioTransport,
        C: Clock,
        K: MessageSink + ?Sized,
    {
        match self.session.state() {
            SessionState::Receiving => self.receive(radio, clock, sink).await,
            _ => self.idle(radio, clock).await,
        }
    }

    async fn idle<R, C>(&mut self, radio: &mut R, clock: &mut C) -> Step
    where
        R: RadioTransport,
        C: Clock,
    {
        let now = clock.now_ms();
        // A long silence power-cycles the radio before listening again
        self.session.power_down_if_idle(radio, now).await;

        if let Err(e) = self.session.wake(radio, now).await {
            let reason = format!("radio init failed: {}", e);
            let step = self.session.record_failure(self.endpoint.storage(), &reason);
            clock.delay_ms(self.session.config().rx_poll_interval_ms).await;
            return step;
        }
        self.session.transition(SessionState::Receiving);
        Step::Continue
    }

    async fn receive<R, C, K>(&mut self, radio: &mut R, clock: &mut C, sink: &mut K) -> Step
    where
        R: RadioTransport,
        C: Clock,
        K: MessageSink + ?Sized,
    {
        let step = match radio.recv(self.session.config().rx_poll_interval_ms).await {
            Ok(packet) => {
                self.session.record_success();
                let now = clock.now_ms();
                let reception = self.receiver.on_frame(&packet.data, now, &mut self.endpoint, sink);

                if let Some(from) = reception.from.as_deref() {
                    self.session.touch(now);
                    self.peers
                        .seen(from, now, packet.rssi, reception.completed.is_some());
                }
                if let Some(frame) = reception.control {
                    self.on_control(frame);
                }
                self.transmit(radio, clock, &reception.replies).await
            }
            Err(RadioError::Timeout) => {
                self.session.record_success();
                Step::Continue
            }
            Err(e) if e.kind() == ErrorKind::Retry => {
                log::debug!("session: receive error: {}", e);
                Step::Continue
            }
            Err(e) => {
                self.session.radio_lost();
                let reason = format!("receive failed: {}", e);
                self.session.record_failure(self.endpoint.storage(), &reason)
            }
        };

        self.session.transition(SessionState::Idle);
        step
    }

    fn on_control(&mut self, frame: Frame) {
        match frame.kind {
            FrameType::AckCmd => {
                let result = frame.result.as_deref().unwrap_or_default();
                log::info!(
                    "session: {} ran command of message {}: {}",
                    frame.unit_id,
                    frame.mid,
                    result
                );
                self.peers.record_result(&frame.unit_id, result);
            }
            _ => log::debug!("session: ignored {:?} from {}", frame.kind, frame.unit_id),
        }
    }

    async fn transmit<R, C>(&mut self, radio: &mut R, clock: &mut C, replies: &[Vec<u8>]) -> Step
    where
        R: RadioTransport,
        C: Clock,
    {
        for reply in replies {
            match self
                .backoff
                .wait_for_channel(radio, clock, self.max_cad_attempts)
                .await
            {
                Ok(()) => {}
                // The sender retransmits and the receiver re-acks
                Err(TransferError::ChannelBusy) => {
                    let rssi = radio.rssi().await;
                    log::debug!(
                        "session: channel busy at {} dBm, {} reply(s) dropped",
                        rssi,
                        replies.len()
                    );
                    return Step::Continue;
                }
                Err(e) => {
                    self.session.radio_lost();
                    let reason = format!("cad failed: {}", e);
                    return self.session.record_failure(self.endpoint.storage(), &reason);
                }
            }
            match radio.send(reply).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Wedge => {
                    self.session.radio_lost();
                    let reason = format!("send failed: {}", e);
                    return self.session.record_failure(self.endpoint.storage(), &reason);
                }
                // The sender retransmits and the receiver re-acks
                Err(e) => log::debug!("session: reply not sent: {}", e),
            }
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mock::MockClock;
    use crate::lora::mock::MockRadio;
    use crate::lora::ChannelState;
    use crate::security::{DeviceSecret, Keyring, SecurityConfig};
    use crate::storage::MemoryStorage;
    use crate::transfer::Archive;
    use futures::executor::block_on;

    fn keyring() -> Keyring {
        let mut keyring = Keyring::new();
        keyring.insert("r1", DeviceSecret::new([0x21; 32]));
        keyring.insert("r2", DeviceSecret::new([0x22; 32]));
        keyring
    }

    fn endpoint(unit_id: &str) -> Endpoint<MemoryStorage> {
        Endpoint::load(unit_id, SecurityConfig::default(), keyring(), MemoryStorage::new()).unwrap()
    }

    struct Rig {
        clock: MockClock,
        radio: MockRadio,
        base: BaseSession<MemoryStorage>,
        delivered: Vec<(String, Vec<u8>)>,
    }

    impl Rig {
        fn new(config: SessionConfig) -> Self {
            let clock = MockClock::starting_at(1_000);
            let radio = MockRadio::new(clock.clone());
            let base = BaseSession::new(
                config,
                TransferConfig::default(),
                endpoint("base"),
                Backoff::new(5, 100, 3_000),
                clock.now_ms(),
            )
            .unwrap();
            Self {
                clock,
                radio,
                base,
                delivered: Vec::new(),
            }
        }

        fn step(&mut self) -> Step {
            let delivered = &mut self.delivered;
            let mut sink = |unit_id: &str, payload: &[u8]| {
                delivered.push((unit_id.to_string(), payload.to_vec()));
            };
            block_on(self.base.step(&mut self.radio, &mut self.clock, &mut sink))
        }

        /// Queue a one-chunk report from `remote` and run a receive cycle
        fn report(&mut self, remote: &mut Endpoint<MemoryStorage>, mid: u64, payload: &[u8]) {
            let frame = Frame::telemetry(remote.unit_id(), mid, 0, 1, payload);
            let bytes = remote.seal(frame).unwrap();
            self.radio.queue_rx(&bytes);
            self.step();
            self.step();
        }

        fn replies(&self) -> Vec<Frame> {
            self.radio
                .tx_history()
                .iter()
                .map(|bytes| Frame::decode(bytes).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_receives_acks_and_archives() {
        let mut rig = Rig::new(SessionConfig::default());
        let mut r1 = endpoint("r1");

        rig.report(&mut r1, 5_000, b"{\"t\":20}");

        assert_eq!(rig.delivered, vec![("r1".to_string(), b"{\"t\":20}".to_vec())]);
        let kinds: Vec<FrameType> = rig.replies().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameType::ChunkAck, FrameType::Ack]);
        assert_eq!(rig.base.session().state(), SessionState::Idle);

        let peer = rig.base.peers().get("r1").unwrap();
        assert_eq!(peer.messages, 1);
        assert_eq!(peer.last_rssi, -70);

        let archive = Archive::load(rig.base.endpoint().storage(), 5).unwrap();
        let records = archive.records(rig.base.endpoint().storage()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"{\"t\":20}");
    }

    #[test]
    fn test_command_rides_on_final_ack() {
        let mut rig = Rig::new(SessionConfig::default());
        let mut r1 = endpoint("r1");

        assert_eq!(rig.base.queue_command("r1:led_on()"), Ok(1));
        assert_eq!(rig.base.queue_command("r1:led on"), Err(CommandError::Malformed));
        rig.report(&mut r1, 5_000, b"x");

        let ack = rig.replies().pop().unwrap();
        assert_eq!(ack.kind, FrameType::Ack);
        assert_eq!(ack.cmd.as_deref(), Some("r1:led_on()"));

        let result = Frame::command_result("r1", "base", 5_000, "ok");
        let bytes = r1.seal(result).unwrap();
        rig.radio.queue_rx(&bytes);
        rig.step();
        rig.step();
        assert_eq!(
            rig.base.peers().get("r1").unwrap().last_result.as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn test_broadcast_queued_per_known_peer() {
        let mut rig = Rig::new(SessionConfig::default());
        assert_eq!(rig.base.queue_command("*:ping()"), Ok(0));

        let mut r1 = endpoint("r1");
        let mut r2 = endpoint("r2");
        rig.report(&mut r1, 5_000, b"a");
        rig.report(&mut r2, 6_000, b"b");

        assert_eq!(rig.base.queue_command("*:ping()"), Ok(2));
        assert_eq!(rig.base.receiver().pending_commands(), 2);
    }

    #[test]
    fn test_unknown_sender_is_ignored() {
        let mut rig = Rig::new(SessionConfig::default());
        let keyring = Keyring::single("r9", DeviceSecret::new([0x99; 32]));
        let mut stranger =
            Endpoint::load("r9", SecurityConfig::default(), keyring, MemoryStorage::new()).unwrap();

        rig.report(&mut stranger, 5_000, b"x");

        assert!(rig.delivered.is_empty());
        assert!(rig.radio.tx_history().is_empty());
        assert!(rig.base.peers().is_empty());
    }

    #[test]
    fn test_receive_faults_escalate() {
        let config = SessionConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let mut rig = Rig::new(config);

        rig.step();
        rig.radio.push_rx_error(RadioError::Hardware);
        assert_eq!(rig.step(), Step::Continue);
        assert!(!rig.base.session().is_powered());

        // Re-initialised before listening again
        rig.step();
        assert_eq!(rig.radio.init_calls(), 2);
        rig.radio.push_rx_error(RadioError::Hardware);
        assert_eq!(rig.step(), Step::Reset);
    }

    #[test]
    fn test_crc_errors_do_not_count() {
        let mut rig = Rig::new(SessionConfig::default());
        rig.step();
        rig.radio.push_rx_error(RadioError::CrcMismatch);
        rig.step();
        assert_eq!(rig.base.session().failures(), 0);
        assert!(rig.base.session().is_powered());
    }

    #[test]
    fn test_busy_channel_delays_reply() {
        let mut rig = Rig::new(SessionConfig::default());
        let mut r1 = endpoint("r1");
        rig.radio.push_cad(ChannelState::Busy);
        let before = rig.clock.now_ms();

        rig.report(&mut r1, 5_000, b"x");

        assert_eq!(rig.replies().len(), 2);
        assert!(rig.clock.now_ms() >= before + 100);
        assert_eq!(rig.radio.cad_calls(), 3);
    }

    #[test]
    fn test_busy_channel_drops_replies_without_failure() {
        let mut rig = Rig::new(SessionConfig::default());
        let mut r1 = endpoint("r1");
        for _ in 0..crate::config::session::MAX_CAD_ATTEMPTS {
            rig.radio.push_cad(ChannelState::Busy);
        }

        rig.report(&mut r1, 5_000, b"x");

        assert_eq!(rig.delivered.len(), 1);
        assert!(rig.replies().is_empty());
        assert_eq!(rig.base.session().failures(), 0);
        assert!(rig.base.session().is_powered());
        assert_eq!(rig.radio.rssi_calls(), 1);

        // The retransmission is re-acked once the channel clears
        rig.report(&mut r1, 5_000, b"x");
        assert_eq!(rig.delivered.len(), 1);
        let kinds: Vec<FrameType> = rig.replies().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameType::ChunkAck, FrameType::Ack]);
    }
}
