use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};

use super::ProtocolVersion;

/// Stable key of a queued entry inside the scheduler's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryHandle(pub(crate) u64);

impl EntryHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// QUEUE callback bookkeeping of one entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallbackFlags {
    /// Sitting in the outbound callback FIFO.
    pub pending: bool,
    /// No usable contact, or the last attempt could not connect.
    pub unreachable: bool,
    /// A QUEUE line was delivered and we wait for the peer's request.
    pub sent: bool,
    /// The identifier has been handed out in a reply header.
    pub id_sent: bool,
}

impl CallbackFlags {
    pub fn blocks_callback(self) -> bool {
        self.pending || self.unreachable
    }
}

#[derive(Clone, Debug)]
pub struct QueuedEntry {
    pub(crate) handle: EntryHandle,
    pub(crate) id: String,
    pub(crate) remote_ip: IpAddr,
    pub(crate) lookup_ip: IpAddr,
    pub(crate) name: String,
    pub(crate) file_size: u64,
    pub(crate) chunk_size: u64,
    pub(crate) tier: usize,
    pub(crate) position: usize,
    pub(crate) relative_position: usize,
    pub(crate) queue_position: usize,
    pub(crate) eta: u64,
    pub(crate) entered_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) retry_at: DateTime<Utc>,
    pub(crate) expire_at: DateTime<Utc>,
    pub(crate) ban_until: Option<DateTime<Utc>>,
    pub(crate) disconnect_penalty_until: Option<DateTime<Utc>>,
    pub(crate) last_queue_sent: Option<DateTime<Utc>>,
    pub(crate) queue_sent: u32,
    pub(crate) queue_refused: u32,
    pub(crate) alive: bool,
    pub(crate) has_slot: bool,
    pub(crate) had_slot: bool,
    pub(crate) flags: CallbackFlags,
    pub(crate) contact: Option<SocketAddr>,
    pub(crate) version: ProtocolVersion,
}

impl QueuedEntry {
    pub fn handle(&self) -> EntryHandle {
        self.handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 1-based number of the size-tiered queue holding this entry.
    pub fn queue_no(&self) -> usize {
        self.tier + 1
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Rank among alive entries of the queue, slot holders included.
    pub fn relative_position(&self) -> usize {
        self.relative_position
    }

    /// Rank among alive entries still waiting for a slot; 0 for slot holders.
    pub fn queue_position(&self) -> usize {
        self.queue_position
    }

    pub fn eta(&self) -> u64 {
        self.eta
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn retry_at(&self) -> DateTime<Utc> {
        self.retry_at
    }

    pub fn expire_at(&self) -> DateTime<Utc> {
        self.expire_at
    }

    pub fn ban_until(&self) -> Option<DateTime<Utc>> {
        self.ban_until
    }

    pub fn last_queue_sent(&self) -> Option<DateTime<Utc>> {
        self.last_queue_sent
    }

    pub fn queue_sent(&self) -> u32 {
        self.queue_sent
    }

    pub fn queue_refused(&self) -> u32 {
        self.queue_refused
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn has_slot(&self) -> bool {
        self.has_slot
    }

    pub fn had_slot(&self) -> bool {
        self.had_slot
    }

    pub fn flags(&self) -> CallbackFlags {
        self.flags
    }

    pub fn contact(&self) -> Option<SocketAddr> {
        self.contact
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }
}
