//! Sending side of the chunked transfer

use super::{Backoff, Endpoint, TransferConfig, TransferError};
use crate::clock::Clock;
use crate::lora::{ErrorKind, RadioError, RadioTransport};
use crate::protocol::{ChunkPlan, Frame, FrameError, FrameType};
use crate::storage::{decode_u64, RedundantRecord, Storage, StorageError};
use alloc::string::String;
use alloc::vec::Vec;

const MID_KEY: &str = "mid/high";

/// Message-id span reserved per persisted write (ten minutes of clock)
pub const MID_RESERVE: u64 = 600_000;

/// Strictly increasing message ids
///
/// Ids follow the local millisecond clock but never repeat or go backwards,
/// including across a reboot that resets the clock: a high-water mark is
/// persisted ahead of use and restored as the floor on boot.
///
/// With both copies of the mark unreadable the generator falls back to the
/// clock alone.
#[derive(Debug, Clone)]
pub struct MidGenerator {
    last: u64,
    reserved: u64,
    record: RedundantRecord,
}

impl MidGenerator {
    pub fn load<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, StorageError> {
        let (record, reserved) = match RedundantRecord::load(storage, MID_KEY, decode_u64) {
            Ok((record, Some(recovered))) if recovered.degraded => {
                (record, recovered.value.saturating_add(MID_RESERVE))
            }
            Ok((record, Some(recovered))) => (record, recovered.value),
            Ok((record, None)) => (record, 0),
            Err(StorageError::Corrupt) => {
                log::warn!("transfer: message-id mark lost, following the clock");
                (RedundantRecord::new(MID_KEY), 0)
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            last: reserved,
            reserved,
            record,
        })
    }

    pub fn next<S: Storage + ?Sized>(
        &mut self,
        now_ms: u64,
        storage: &mut S,
    ) -> Result<u64, StorageError> {
        let mid = now_ms.max(self.last.saturating_add(1));
        if mid >= self.reserved {
            let reserved = mid.saturating_add(MID_RESERVE);
            self.record.store(storage, &reserved.to_le_bytes())?;
            self.reserved = reserved;
        }
        self.last = mid;
        Ok(mid)
    }
}

/// Outcome of [`Sender::deliver`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub mid: u64,
    /// Final ack received
    pub delivered: bool,
    /// Command piggybacked on the final ack
    pub command: Option<String>,
    /// Standalone `cmd` frames received while waiting for acks
    pub control: Vec<Frame>,
    /// Frames put on air
    pub transmissions: u32,
    /// Whole-message attempts made
    pub attempts: u8,
    /// Error that ended the transfer before its retries were used up
    pub fault: Option<TransferError>,
}

enum Attempt {
    Acked(Frame),
    Abandoned,
    Fatal(TransferError),
}

enum Action {
    Retry,
    Shrink,
    Fatal,
}

fn classify(error: &TransferError) -> Action {
    match error {
        TransferError::Frame(FrameError::TooLong(_)) | TransferError::Radio(RadioError::Oversize) => {
            Action::Shrink
        }
        TransferError::Radio(e) if e.kind() == ErrorKind::Retry => Action::Retry,
        TransferError::ChannelBusy => Action::Retry,
        _ => Action::Fatal,
    }
}

fn is_chunk_ack(frame: &Frame, mid: u64, idx: usize) -> bool {
    frame.kind == FrameType::ChunkAck && frame.mid == mid && frame.chunk_idx == Some(idx as u16)
}

fn is_ack(frame: &Frame, mid: u64) -> bool {
    frame.kind == FrameType::Ack && frame.mid == mid
}

/// Reliable sender towards a single peer
pub struct Sender {
    peer: String,
    config: TransferConfig,
    mids: MidGenerator,
    backoff: Backoff,
    inbox: Vec<Frame>,
}

impl Sender {
    pub fn new(peer: &str, config: TransferConfig, mids: MidGenerator, backoff: Backoff) -> Self {
        Self {
            peer: String::from(peer),
            config,
            mids,
            backoff,
            inbox: Vec::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Send `payload` and report whether the peer acknowledged it
    pub async fn send_message<R, C, S>(
        &mut self,
        radio: &mut R,
        clock: &mut C,
        endpoint: &mut Endpoint<S>,
        payload: &[u8],
        max_retries: u8,
    ) -> bool
    where
        R: RadioTransport,
        C: Clock,
        S: Storage,
    {
        self.deliver(radio, clock, endpoint, payload, max_retries)
            .await
            .delivered
    }

    /// Send `payload`, retrying the whole message up to `max_retries` times
    /// when the final ack does not arrive
    pub async fn deliver<R, C, S>(
        &mut self,
        radio: &mut R,
        clock: &mut C,
        endpoint: &mut Endpoint<S>,
        payload: &[u8],
        max_retries: u8,
    ) -> Delivery
    where
        R: RadioTransport,
        C: Clock,
        S: Storage,
    {
        let mut delivery = Delivery::default();
        let mid = match self.mids.next(clock.now_ms(), endpoint.storage()) {
            Ok(mid) => mid,
            Err(e) => {
                log::error!("transfer: cannot allocate message id: {}", e);
                delivery.fault = Some(e.into());
                return delivery;
            }
        };
        delivery.mid = mid;

        let mut plan = ChunkPlan::new(payload.len(), self.config.chunk_size);
        log::debug!(
            "transfer: message {} ({} bytes, {} chunks)",
            mid,
            payload.len(),
            plan.len()
        );

        for attempt in 0..=max_retries {
            delivery.attempts = delivery.attempts.saturating_add(1);
            if plan.len() > u16::MAX as usize {
                delivery.fault = Some(TransferError::Frame(FrameError::InvalidChunk));
                break;
            }

            match self
                .attempt(radio, clock, endpoint, payload, mid, &mut plan, &mut delivery)
                .await
            {
                Attempt::Acked(ack) => {
                    log::info!("transfer: message {} acknowledged", mid);
                    delivery.delivered = true;
                    delivery.command = ack.cmd;
                    break;
                }
                Attempt::Abandoned => {
                    log::info!(
                        "transfer: message {} attempt {}/{} unacknowledged",
                        mid,
                        attempt as u16 + 1,
                        max_retries as u16 + 1
                    );
                }
                Attempt::Fatal(e) => {
                    log::warn!("transfer: message {} aborted: {}", mid, e);
                    delivery.fault = Some(e);
                    break;
                }
            }
        }

        delivery.control = core::mem::take(&mut self.inbox);
        delivery
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt<R, C, S>(
        &mut self,
        radio: &mut R,
        clock: &mut C,
        endpoint: &mut Endpoint<S>,
        payload: &[u8],
        mid: u64,
        plan: &mut ChunkPlan,
        delivery: &mut Delivery,
    ) -> Attempt
    where
        R: RadioTransport,
        C: Clock,
        S: Storage,
    {
        let mut idx = 0;
        while idx < plan.len() {
            let mut retries = 0u8;
            loop {
                let frame = Frame::telemetry(
                    endpoint.unit_id(),
                    mid,
                    idx as u16,
                    plan.len() as u16,
                    plan.chunk(payload, idx),
                );

                match self.transmit(radio, clock, endpoint, frame).await {
                    Ok(()) => {
                        delivery.transmissions += 1;
                        let timeout = self.config.chunk_ack_timeout_ms;
                        let reply = self
                            .await_reply(radio, clock, endpoint, timeout, |f| {
                                is_chunk_ack(f, mid, idx) || is_ack(f, mid)
                            })
                            .await;
                        match reply {
                            Ok(Some(frame)) if frame.kind == FrameType::Ack => {
                                return Attempt::Acked(frame)
                            }
                            Ok(Some(_)) => break,
                            Ok(None) => {
                                log::debug!("transfer: chunk {}/{} of {} timed out", idx, plan.len(), mid)
                            }
                            Err(e) => return Attempt::Fatal(e),
                        }
                    }
                    Err(e) => match classify(&e) {
                        Action::Shrink => {
                            let size = plan.chunk_size();
                            if size <= self.config.min_chunk_size {
                                log::warn!("transfer: chunk {} oversize at minimum size {}", idx, size);
                                return Attempt::Abandoned;
                            }
                            let smaller = (size / 2).max(self.config.min_chunk_size);
                            plan.resplit_from(idx, smaller);
                            log::info!(
                                "transfer: chunk size {} -> {}, {} chunks",
                                size,
                                smaller,
                                plan.len()
                            );
                            continue;
                        }
                        Action::Retry => log::debug!("transfer: chunk {} not sent: {}", idx, e),
                        Action::Fatal => return Attempt::Fatal(e),
                    },
                }

                retries += 1;
                if retries > self.config.chunk_retries {
                    return Attempt::Abandoned;
                }
            }
            idx += 1;
        }

        let timeout = self.config.final_ack_timeout_ms;
        match self
            .await_reply(radio, clock, endpoint, timeout, |f| is_ack(f, mid))
            .await
        {
            Ok(Some(ack)) => Attempt::Acked(ack),
            Ok(None) => Attempt::Abandoned,
            Err(e) => Attempt::Fatal(e),
        }
    }

    async fn transmit<R, C, S>(
        &mut self,
        radio: &mut R,
        clock: &mut C,
        endpoint: &mut Endpoint<S>,
        frame: Frame,
    ) -> Result<(), TransferError>
    where
        R: RadioTransport,
        C: Clock,
        S: Storage,
    {
        let bytes = endpoint.seal(frame)?;
        self.wait_for_channel(radio, clock).await?;
        radio.send(&bytes).await?;
        Ok(())
    }

    /// CAD-gate the next transmission
    pub async fn wait_for_channel<R, C>(
        &mut self,
        radio: &mut R,
        clock: &mut C,
    ) -> Result<(), TransferError>
    where
        R: RadioTransport,
        C: Clock,
    {
        self.backoff
            .wait_for_channel(radio, clock, self.config.max_cad_attempts)
            .await
    }

    /// Receive until a frame from the peer satisfies `matches` or the
    /// timeout expires
    async fn await_reply<R, C, S, P>(
        &mut self,
        radio: &mut R,
        clock: &mut C,
        endpoint: &mut Endpoint<S>,
        timeout_ms: u32,
        matches: P,
    ) -> Result<Option<Frame>, TransferError>
    where
        R: RadioTransport,
        C: Clock,
        S: Storage,
        P: Fn(&Frame) -> bool,
    {
        let deadline = clock.now_ms() + timeout_ms as u64;
        loop {
            let now = clock.now_ms();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = (deadline - now).min(u32::MAX as u64) as u32;

            match radio.recv(remaining).await {
                Ok(packet) => match endpoint.open(&packet.data) {
                    Ok(frame) if frame.unit_id == self.peer && matches(&frame) => {
                        return Ok(Some(frame))
                    }
                    Ok(frame) if frame.kind == FrameType::Cmd => {
                        if self.inbox.len() < crate::config::session::MAX_PENDING_COMMANDS {
                            self.inbox.push(frame);
                        }
                    }
                    Ok(frame) => {
                        log::trace!("transfer: ignoring {:?} {} from {}", frame.kind, frame.mid, frame.unit_id)
                    }
                    Err(e) => log::trace!("transfer: dropped frame: {}", e),
                },
                Err(RadioError::Timeout) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Retry => log::debug!("transfer: receive error: {}", e),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_mid_strictly_increasing_on_same_millisecond() {
        let mut storage = MemoryStorage::new();
        let mut mids = MidGenerator::load(&mut storage).unwrap();
        let a = mids.next(5_000, &mut storage).unwrap();
        let b = mids.next(5_000, &mut storage).unwrap();
        let c = mids.next(4_000, &mut storage).unwrap();
        assert_eq!(a, 5_000);
        assert!(b > a && c > b);
    }

    #[test]
    fn test_mid_survives_clock_reset() {
        let mut storage = MemoryStorage::new();
        let mut mids = MidGenerator::load(&mut storage).unwrap();
        let before = mids.next(90_000, &mut storage).unwrap();

        // Reboot: the clock starts again from zero
        let mut mids = MidGenerator::load(&mut storage).unwrap();
        let after = mids.next(10, &mut storage).unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_mid_mark_unreadable_falls_back_to_clock() {
        let mut storage = MemoryStorage::new();
        storage.write("mid/high/a", &[9]).unwrap();
        storage.write("mid/high/b", &[1]).unwrap();

        let mut mids = MidGenerator::load(&mut storage).unwrap();
        assert_eq!(mids.next(7_000, &mut storage).unwrap(), 7_000);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify(&TransferError::Radio(RadioError::Oversize)),
            Action::Shrink
        ));
        assert!(matches!(
            classify(&TransferError::Frame(FrameError::TooLong(300))),
            Action::Shrink
        ));
        assert!(matches!(
            classify(&TransferError::Radio(RadioError::Transient)),
            Action::Retry
        ));
        assert!(matches!(classify(&TransferError::ChannelBusy), Action::Retry));
        assert!(matches!(
            classify(&TransferError::Radio(RadioError::Hardware)),
            Action::Fatal
        ));
    }
}
