//! End-to-end link tests.
//!
//! A remote session and a base session talk over a simulated channel. Every
//! frame the remote transmits is handed to the base, which runs a receive
//! cycle and sends its replies back, optionally losing some on the way.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use field_link_firmware::clock::Clock;
use field_link_firmware::commands::{CommandArgs, CommandError, CommandOutcome, CommandRegistry};
use field_link_firmware::lora::{ChannelState, RadioError, RadioTransport, RxPacket};
use field_link_firmware::protocol::{Frame, FrameType, Reading};
use field_link_firmware::security::{DeviceSecret, Keyring, SecurityConfig};
use field_link_firmware::session::{BaseSession, RemoteSession, SessionConfig, SessionState};
use field_link_firmware::storage::MemoryStorage;
use field_link_firmware::transfer::{Backoff, Delivery, Endpoint, TransferConfig};
use futures::executor::block_on;
use futures::FutureExt;

const SECRET: [u8; 32] = [0x6B; 32];

#[derive(Clone, Default)]
struct SimClock(Rc<Cell<u64>>);

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.0.set(self.0.get() + ms as u64);
    }
}

fn packet(data: &[u8]) -> RxPacket {
    RxPacket {
        data: heapless::Vec::from_slice(data).unwrap(),
        rssi: -88,
        snr: 6,
    }
}

/// Radio on the base side: frames arrive in `inbox`, replies pile up in
/// `outbox`
struct BaseRadio {
    clock: SimClock,
    inbox: VecDeque<Vec<u8>>,
    outbox: Vec<Vec<u8>>,
}

impl RadioTransport for BaseRadio {
    async fn init(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn deinit(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        self.outbox.push(data.to_vec());
        Ok(data.len())
    }

    async fn recv(&mut self, timeout_ms: u32) -> Result<RxPacket, RadioError> {
        match self.inbox.pop_front() {
            Some(data) => Ok(packet(&data)),
            None => {
                self.clock.0.set(self.clock.0.get() + timeout_ms as u64);
                Err(RadioError::Timeout)
            }
        }
    }

    async fn channel_clear(&mut self) -> ChannelState {
        ChannelState::Free
    }

    async fn rssi(&mut self) -> i16 {
        -110
    }
}

struct BaseNode {
    session: BaseSession<MemoryStorage>,
    radio: BaseRadio,
    clock: SimClock,
    delivered: Vec<(String, Vec<u8>)>,
    /// Downlink frame types to lose, each entry once
    lose: Vec<FrameType>,
}

impl BaseNode {
    /// Hand one uplink frame to the base and collect what it sends back
    fn exchange(&mut self, uplink: &[u8]) -> Vec<Vec<u8>> {
        self.radio.inbox.push_back(uplink.to_vec());

        let BaseNode {
            session,
            radio,
            clock,
            delivered,
            ..
        } = self;
        let mut sink = |unit_id: &str, payload: &[u8]| {
            delivered.push((unit_id.to_string(), payload.to_vec()));
        };
        // Idle -> Receiving, then one receive cycle
        for _ in 0..2 {
            session
                .step(radio, clock, &mut sink)
                .now_or_never()
                .expect("simulated radio never blocks");
        }

        let replies = std::mem::take(&mut self.radio.outbox);
        replies
            .into_iter()
            .filter(|reply| {
                let kind = Frame::decode(reply).unwrap().kind;
                match self.lose.iter().position(|k| *k == kind) {
                    Some(i) => {
                        self.lose.remove(i);
                        false
                    }
                    None => true,
                }
            })
            .collect()
    }
}

/// Radio on the remote side; transmissions are exchanged with the base
struct RemoteRadio {
    clock: SimClock,
    base: Rc<RefCell<BaseNode>>,
    inbox: VecDeque<Vec<u8>>,
}

impl RadioTransport for RemoteRadio {
    async fn init(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn deinit(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        let replies = self.base.borrow_mut().exchange(data);
        self.inbox.extend(replies);
        Ok(data.len())
    }

    async fn recv(&mut self, timeout_ms: u32) -> Result<RxPacket, RadioError> {
        match self.inbox.pop_front() {
            Some(data) => Ok(packet(&data)),
            None => {
                self.clock.0.set(self.clock.0.get() + timeout_ms as u64);
                Err(RadioError::Timeout)
            }
        }
    }

    async fn channel_clear(&mut self) -> ChannelState {
        ChannelState::Free
    }

    async fn rssi(&mut self) -> i16 {
        -110
    }
}

fn blink(args: &CommandArgs) -> Result<CommandOutcome, CommandError> {
    let times: u8 = args.parse(0)?;
    Ok(CommandOutcome::with(if times > 5 { "long" } else { "short" }))
}

fn remote_session(clock: &SimClock, storage: MemoryStorage) -> RemoteSession<MemoryStorage> {
    let keyring = Keyring::single("r1", DeviceSecret::new(SECRET));
    let endpoint = Endpoint::load("r1", SecurityConfig::default(), keyring, storage).unwrap();
    let mut registry = CommandRegistry::new();
    registry.register_command("blink", blink).unwrap();
    RemoteSession::new(
        "base",
        SessionConfig::default(),
        TransferConfig::default(),
        endpoint,
        registry,
        Backoff::new(1, 100, 3_000),
        clock.now_ms(),
    )
    .unwrap()
}

struct Link {
    clock: SimClock,
    remote: RemoteSession<MemoryStorage>,
    radio: RemoteRadio,
    base: Rc<RefCell<BaseNode>>,
    seq: u32,
}

impl Link {
    fn new() -> Self {
        let clock = SimClock::default();
        clock.0.set(10_000);

        let keyring = Keyring::single("r1", DeviceSecret::new(SECRET));
        let endpoint = Endpoint::load("base", SecurityConfig::default(), keyring, MemoryStorage::new()).unwrap();
        let session = BaseSession::new(
            SessionConfig::default(),
            TransferConfig::default(),
            endpoint,
            Backoff::new(2, 100, 3_000),
            clock.now_ms(),
        )
        .unwrap();
        let base = Rc::new(RefCell::new(BaseNode {
            session,
            radio: BaseRadio {
                clock: clock.clone(),
                inbox: VecDeque::new(),
                outbox: Vec::new(),
            },
            clock: clock.clone(),
            delivered: Vec::new(),
            lose: Vec::new(),
        }));

        Self {
            remote: remote_session(&clock, MemoryStorage::new()),
            radio: RemoteRadio {
                clock: clock.clone(),
                base: base.clone(),
                inbox: VecDeque::new(),
            },
            clock,
            base,
            seq: 0,
        }
    }

    /// Run the remote until one report has been sent and its response
    /// window has closed
    fn report(&mut self) -> Delivery {
        let Link {
            clock,
            remote,
            radio,
            seq,
            ..
        } = self;
        let mut source = || {
            *seq += 1;
            let reading = Reading {
                uptime_ms: clock.now_ms(),
                seq: *seq,
                temperature_c: Some(18.25),
                humidity_pct: Some(71.5),
                pressure_hpa: Some(1013.2),
                rssi_dbm: Some(-110),
            };
            // Pad the report so it needs several chunks
            let mut payload = reading.to_json();
            payload.extend(std::iter::repeat(b' ').take(120));
            payload
        };

        block_on(async {
            while remote.session().state() != SessionState::Sending {
                remote.step(radio, &mut clock.clone(), &mut source).await;
            }
            remote.step(radio, &mut clock.clone(), &mut source).await;
            while remote.session().state() != SessionState::Idle {
                remote.step(radio, &mut clock.clone(), &mut source).await;
            }
        });
        self.remote.last_delivery().cloned().unwrap()
    }

    fn delivered(&self) -> Vec<(String, Vec<u8>)> {
        self.base.borrow().delivered.clone()
    }
}

#[test]
fn test_reports_reach_the_base() {
    let mut link = Link::new();

    let first = link.report();
    let second = link.report();

    assert!(first.delivered && second.delivered);
    assert!(second.mid > first.mid);
    assert!(first.transmissions > 1);

    let delivered = link.delivered();
    assert_eq!(delivered.len(), 2);
    let reading = Reading::from_json(delivered[1].1.trim_ascii_end()).unwrap();
    assert_eq!(reading.seq, 2);
    assert_eq!(reading.humidity_pct, Some(71.5));

    let base = link.base.borrow();
    let peer = base.session.peers().get("r1").unwrap();
    assert_eq!(peer.messages, 2);
    assert_eq!(peer.last_rssi, -88);
}

#[test]
fn test_command_round_trip() {
    let mut link = Link::new();
    link.base.borrow_mut().session.queue_command("r1:blink(7)").unwrap();

    let delivery = link.report();

    assert_eq!(delivery.command.as_deref(), Some("r1:blink(7)"));
    let base = link.base.borrow();
    let peer = base.session.peers().get("r1").unwrap();
    assert_eq!(peer.last_result.as_deref(), Some("long"));
}

#[test]
fn test_lost_final_ack_is_not_delivered_twice() {
    let mut link = Link::new();
    link.base.borrow_mut().lose.push(FrameType::Ack);

    let delivery = link.report();

    assert!(delivery.delivered);
    assert_eq!(delivery.attempts, 2);
    assert_eq!(link.delivered().len(), 1);
}

#[test]
fn test_counters_survive_a_remote_reboot() {
    let mut link = Link::new();
    assert!(link.report().delivered);

    // Same flash after a reboot: counters resume above what the base saw
    let storage = link.remote.endpoint().storage().clone();
    link.remote = remote_session(&link.clock, storage);
    assert!(link.report().delivered);
    assert_eq!(link.delivered().len(), 2);

    // Wiped flash restarts the counter and is refused as a replay
    link.remote = remote_session(&link.clock, MemoryStorage::new());
    let delivery = link.report();
    assert!(!delivery.delivered);
    assert_eq!(link.delivered().len(), 2);
    let mut base = link.base.borrow_mut();
    assert!(base.session.endpoint().guard().security_events() > 0);
}
