//! Receiving side of the chunked transfer
//!
//! Partial messages live in a bounded arena keyed by `(unit_id, mid)`.
//! Completed keys are remembered for a while so a retransmitted message
//! (the sender missed our final ack) is acknowledged again without being
//! delivered twice.

use super::archive::{Archive, ArchivedMessage};
use super::{Endpoint, TransferConfig, TransferError};
use crate::protocol::{Frame, FrameType};
use crate::storage::{Storage, StorageError};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

/// Consumer of reassembled messages
pub trait MessageSink {
    fn on_message(&mut self, unit_id: &str, payload: &[u8]);
}

impl<F> MessageSink for F
where
    F: FnMut(&str, &[u8]),
{
    fn on_message(&mut self, unit_id: &str, payload: &[u8]) {
        self(unit_id, payload)
    }
}

/// What a received frame produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reception {
    /// Encoded frames to transmit in reply
    pub replies: Vec<Vec<u8>>,
    /// Sender of an authenticated frame
    pub from: Option<String>,
    /// Message delivered to the sink by this frame
    pub completed: Option<u64>,
    /// `cmd` or `ack_cmd` frame for the session
    pub control: Option<Frame>,
}

struct Assembly {
    unit_id: String,
    mid: u64,
    chunks: u16,
    parts: BTreeMap<u16, Vec<u8>>,
    first_seen_ms: u64,
}

impl Assembly {
    fn is_complete(&self) -> bool {
        self.parts.len() == self.chunks as usize
    }

    fn concat(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for part in self.parts.values() {
            payload.extend_from_slice(part);
        }
        payload
    }
}

struct Completed {
    unit_id: String,
    mid: u64,
    /// Command that rode on the final ack, repeated on re-acks
    command: Option<String>,
}

struct PendingCommand {
    unit_id: String,
    envelope: String,
}

pub struct Receiver {
    config: TransferConfig,
    assemblies: Vec<Assembly>,
    completed: VecDeque<Completed>,
    archive: Option<Archive>,
    pending: VecDeque<PendingCommand>,
    suppressed: Vec<(u64, u16)>,
    evicted: u32,
}

impl Receiver {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            assemblies: Vec::new(),
            completed: VecDeque::new(),
            archive: None,
            pending: VecDeque::new(),
            suppressed: Vec::new(),
            evicted: 0,
        }
    }

    /// Receiver that archives completed messages to `storage`
    pub fn with_archive<S: Storage + ?Sized>(
        config: TransferConfig,
        storage: &mut S,
    ) -> Result<Self, StorageError> {
        let mut receiver = Self::new(config);
        receiver.archive = Some(Archive::load(storage, config.keep_n)?);
        Ok(receiver)
    }

    pub fn archive(&self) -> Option<&Archive> {
        self.archive.as_ref()
    }

    /// Partial messages currently held
    pub fn open_assemblies(&self) -> usize {
        self.assemblies.len()
    }

    /// Partial messages dropped for age or arena pressure
    pub fn evicted(&self) -> u32 {
        self.evicted
    }

    /// Drop the next `chunk_ack` for `(mid, chunk_idx)`
    pub fn suppress_chunk_ack(&mut self, mid: u64, chunk_idx: u16) {
        self.suppressed.push((mid, chunk_idx));
    }

    /// Queue `envelope` for delivery on the final ack of `unit_id`'s next
    /// message; returns `false` when the queue is full
    pub fn queue_command(&mut self, unit_id: &str, envelope: &str) -> bool {
        if self.pending.len() >= crate::config::session::MAX_PENDING_COMMANDS {
            return false;
        }
        self.pending.push_back(PendingCommand {
            unit_id: String::from(unit_id),
            envelope: String::from(envelope),
        });
        true
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    fn take_command(&mut self, unit_id: &str) -> Option<String> {
        let pos = self.pending.iter().position(|p| p.unit_id == unit_id)?;
        self.pending.remove(pos).map(|p| p.envelope)
    }

    /// Drop assemblies older than the assembly timeout
    pub fn evict_stale(&mut self, now_ms: u64) {
        let timeout = self.config.assembly_timeout_ms;
        let before = self.assemblies.len();
        self.assemblies.retain(|a| {
            let keep = now_ms.saturating_sub(a.first_seen_ms) <= timeout;
            if !keep {
                log::info!(
                    "transfer: dropping stale message {} from {} ({}/{} chunks)",
                    a.mid,
                    a.unit_id,
                    a.parts.len(),
                    a.chunks
                );
            }
            keep
        });
        self.evicted += (before - self.assemblies.len()) as u32;
    }

    /// Process one received frame
    ///
    /// Frames that fail decoding or the security checks are dropped and
    /// produce an empty [`Reception`].
    pub fn on_frame<S, K>(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
        endpoint: &mut Endpoint<S>,
        sink: &mut K,
    ) -> Reception
    where
        S: Storage,
        K: MessageSink + ?Sized,
    {
        let mut reception = Reception::default();
        self.evict_stale(now_ms);

        let frame = match endpoint.open(bytes) {
            Ok(frame) => frame,
            Err(TransferError::NotForUs) => return reception,
            Err(e) => {
                log::debug!("transfer: dropped frame: {}", e);
                return reception;
            }
        };
        reception.from = Some(frame.unit_id.clone());

        match frame.kind {
            FrameType::Telemetry => self.on_chunk(frame, now_ms, endpoint, sink, &mut reception),
            FrameType::Cmd | FrameType::AckCmd => reception.control = Some(frame),
            FrameType::ChunkAck | FrameType::Ack => {
                log::trace!("transfer: unexpected {:?} from {}", frame.kind, frame.unit_id)
            }
        }
        reception
    }

    fn on_chunk<S, K>(
        &mut self,
        frame: Frame,
        now_ms: u64,
        endpoint: &mut Endpoint<S>,
        sink: &mut K,
        reception: &mut Reception,
    ) where
        S: Storage,
        K: MessageSink + ?Sized,
    {
        // Decode validated both
        let (Some(idx), Some(chunks)) = (frame.chunk_idx, frame.chunks) else {
            return;
        };
        let data = match frame.data_bytes() {
            Ok(data) => data,
            Err(e) => {
                log::debug!("transfer: chunk {} of {}: {}", idx, frame.mid, e);
                return;
            }
        };
        let unit_id = frame.unit_id.as_str();
        let mid = frame.mid;

        if let Some(done) = self
            .completed
            .iter()
            .find(|c| c.unit_id == unit_id && c.mid == mid)
        {
            log::debug!("transfer: re-acking completed message {} from {}", mid, unit_id);
            let command = done.command.clone();
            self.reply_chunk_ack(unit_id, mid, idx, endpoint, reception);
            if idx + 1 == chunks {
                self.reply_ack(unit_id, mid, command, endpoint, reception);
            }
            return;
        }

        let slot = match self
            .assemblies
            .iter()
            .position(|a| a.unit_id == unit_id && a.mid == mid)
        {
            Some(slot) => slot,
            None => {
                if self.assemblies.len() >= self.config.max_open_assemblies {
                    self.evict_oldest();
                }
                self.assemblies.push(Assembly {
                    unit_id: String::from(unit_id),
                    mid,
                    chunks,
                    parts: BTreeMap::new(),
                    first_seen_ms: now_ms,
                });
                self.assemblies.len() - 1
            }
        };

        let assembly = &mut self.assemblies[slot];
        if assembly.chunks != chunks {
            // Sender resplit from `idx` onwards after an oversize rejection
            log::info!(
                "transfer: message {} resplit at chunk {}: {} -> {} chunks",
                mid,
                idx,
                assembly.chunks,
                chunks
            );
            assembly.parts.retain(|&k, _| k < idx);
            assembly.chunks = chunks;
        }
        assembly.parts.insert(idx, data);

        self.reply_chunk_ack(unit_id, mid, idx, endpoint, reception);

        if !self.assemblies[slot].is_complete() {
            return;
        }

        let assembly = self.assemblies.swap_remove(slot);
        let payload = assembly.concat();
        log::info!(
            "transfer: message {} from {} complete ({} bytes)",
            mid,
            unit_id,
            payload.len()
        );
        sink.on_message(unit_id, &payload);
        reception.completed = Some(mid);

        if let Some(archive) = self.archive.as_mut() {
            let record = ArchivedMessage::new(unit_id, mid, &payload, now_ms);
            if let Err(e) = archive.store(endpoint.storage(), &record) {
                log::warn!("transfer: archiving message {} failed: {}", mid, e);
            }
        }

        let command = self.take_command(unit_id);
        if self.completed.len() >= self.config.completed_history {
            self.completed.pop_front();
        }
        self.completed.push_back(Completed {
            unit_id: String::from(unit_id),
            mid,
            command: command.clone(),
        });
        self.reply_ack(unit_id, mid, command, endpoint, reception);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .assemblies
            .iter()
            .enumerate()
            .min_by_key(|(_, a)| a.first_seen_ms)
            .map(|(i, _)| i);
        if let Some(i) = oldest {
            let a = self.assemblies.swap_remove(i);
            log::warn!("transfer: arena full, evicting message {} from {}", a.mid, a.unit_id);
            self.evicted += 1;
        }
    }

    fn reply_chunk_ack<S: Storage>(
        &mut self,
        unit_id: &str,
        mid: u64,
        idx: u16,
        endpoint: &mut Endpoint<S>,
        reception: &mut Reception,
    ) {
        if let Some(pos) = self.suppressed.iter().position(|&s| s == (mid, idx)) {
            self.suppressed.swap_remove(pos);
            log::debug!("transfer: suppressing chunk_ack {} of {}", idx, mid);
            return;
        }
        let ack = Frame::chunk_ack(endpoint.unit_id(), unit_id, mid, idx);
        push_reply(ack, endpoint, reception);
    }

    fn reply_ack<S: Storage>(
        &mut self,
        unit_id: &str,
        mid: u64,
        command: Option<String>,
        endpoint: &mut Endpoint<S>,
        reception: &mut Reception,
    ) {
        let mut ack = Frame::ack(endpoint.unit_id(), unit_id, mid);
        ack.cmd = command;
        push_reply(ack, endpoint, reception);
    }
}

fn push_reply<S: Storage>(frame: Frame, endpoint: &mut Endpoint<S>, reception: &mut Reception) {
    match endpoint.seal(frame) {
        Ok(bytes) => reception.replies.push(bytes),
        Err(e) => log::warn!("transfer: cannot send reply: {}", e),
    }
}
